//! Read-through cache in front of a user store.

use std::sync::Arc;

use async_trait::async_trait;
use tollgate_cache::Cache;
use tracing::debug;

use super::traits::UserStore;
use crate::error::AuthError;
use crate::user::{User, UserId, normalize_username};

/// Caches username lookups. The cache is keyed by normalised username so a
/// password-change event can evict the aggregate with a single delete.
///
/// Misses are not cached: an unknown username always reaches the store.
pub struct CachedUserStore<S> {
    inner: S,
    cache: Arc<dyn Cache<User>>,
}

impl<S: UserStore> CachedUserStore<S> {
    pub fn new(inner: S, cache: Arc<dyn Cache<User>>) -> Self {
        Self { inner, cache }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: UserStore> UserStore for CachedUserStore<S> {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let key = normalize_username(username);
        if let Some(user) = self.cache.get(&key).await {
            return Ok(Some(user));
        }

        let found = self.inner.find_by_username(&key).await?;
        if let Some(user) = &found
            && let Err(e) = self.cache.set(&key, user.clone()).await
        {
            debug!(username = %key, error = %e, "user cache write failed");
        }
        Ok(found)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AuthError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        self.inner.find_by_email(email).await
    }
}
