//! Evicting cached credentials after a password change.

use std::sync::Arc;

use async_trait::async_trait;
use tollgate_auth::normalize_username;
use tollgate_bus::{BusError, Handles, UserPasswordChangedEvent};
use tollgate_cache::Evict;
use tollgate_metrics::record_controller_event;
use tracing::{debug, warn};

/// Handler for `UserPasswordChangedEvent`.
///
/// Deletes the username from every attached cache. Failures are logged and
/// the remaining caches are still cleared; a stale entry lives until its TTL.
#[derive(Clone, Default)]
pub struct PasswordChangeInvalidator {
    caches: Vec<Arc<dyn Evict>>,
}

impl PasswordChangeInvalidator {
    pub fn new(caches: Vec<Arc<dyn Evict>>) -> Self {
        Self { caches }
    }

    pub fn attach(mut self, cache: Arc<dyn Evict>) -> Self {
        self.caches.push(cache);
        self
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Evict `username`; returns how many caches failed.
    pub async fn invalidate(&self, username: &str) -> usize {
        let key = normalize_username(username);
        let mut failed = 0;
        for cache in &self.caches {
            if let Err(e) = cache.evict(&key).await {
                failed += 1;
                warn!(username = %key, error = %e, "cache eviction failed");
            }
        }
        debug!(username = %key, caches = self.caches.len(), failed, "credentials invalidated");
        failed
    }
}

#[async_trait]
impl Handles<UserPasswordChangedEvent> for PasswordChangeInvalidator {
    async fn on_event(&self, event: UserPasswordChangedEvent) -> Result<(), BusError> {
        self.invalidate(&event.username).await;
        record_controller_event("UserPasswordChangedEvent");
        Ok(())
    }
}
