//! Credential verification with a verdict cache.
//!
//! Verdicts are cached per username as a short list of
//! [`AuthCacheEntry`] records keyed by [`credential_key`]. Negative verdicts
//! are cached with the same TTL as positive ones, so a password-guessing
//! client cannot force a hasher run per attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tollgate_cache::Cache;
use tollgate_cache::db::now_unix_ms;
use tollgate_core::MAX_CACHED_CANDIDATES;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::hash::credential_key;
use crate::hasher::PasswordHasher;
use crate::user::{BasicCredentials, User};

/// Result of a prior credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCacheEntry {
    pub user_hash: String,
    pub user_id: i64,
    pub valid: bool,
    /// Unix milliseconds; reads at or after this instant are misses.
    pub valid_until: i64,
}

/// Cached verdicts of one username, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVerdicts {
    pub entries: Vec<AuthCacheEntry>,
}

impl AuthVerdicts {
    /// Find a live verdict for `user_hash` belonging to `user_id`.
    pub fn lookup(&self, user_hash: &str, user_id: i64, now_ms: i64) -> Option<&AuthCacheEntry> {
        self.entries
            .iter()
            .find(|e| e.user_hash == user_hash && e.user_id == user_id && e.valid_until > now_ms)
    }

    /// Insert `entry`, dropping expired and superseded verdicts and keeping at
    /// most [`MAX_CACHED_CANDIDATES`].
    pub fn record(&mut self, entry: AuthCacheEntry, now_ms: i64) {
        self.entries
            .retain(|e| e.valid_until > now_ms && e.user_hash != entry.user_hash);
        self.entries.insert(0, entry);
        self.entries.truncate(MAX_CACHED_CANDIDATES);
    }
}

/// Auth service statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hasher_calls: u64,
}

/// Verifies basic credentials against a user's stored hash.
pub struct AuthService {
    hasher: Arc<dyn PasswordHasher>,
    cache: Arc<dyn Cache<AuthVerdicts>>,
    ttl: Duration,
    /// Serialises cold lookups of identical credentials.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    hasher_calls: AtomicU64,
}

impl AuthService {
    pub fn new(
        hasher: Arc<dyn PasswordHasher>,
        cache: Arc<dyn Cache<AuthVerdicts>>,
        ttl: Duration,
    ) -> Self {
        Self {
            hasher,
            cache,
            ttl: ttl.max(Duration::from_millis(1)),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            hasher_calls: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> AuthStats {
        AuthStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            hasher_calls: self.hasher_calls.load(Ordering::Relaxed),
        }
    }

    /// Check `credentials` against `user`.
    ///
    /// Returns the cached or freshly computed verdict. Hasher failures are
    /// returned as errors and never cached; cache failures fall back to an
    /// uncached verification.
    pub async fn authorize_basic(
        &self,
        user: &User,
        credentials: &BasicCredentials,
    ) -> Result<bool, AuthError> {
        let key = credential_key(&credentials.password, &user.password_hash);
        let user_id = user.id.get();

        if let Some(valid) = self.cached_verdict(&user.username, &key, user_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(valid);
        }

        let gate = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = gate.lock().await;

        // Another caller may have finished the same check while we waited.
        let result = match self.cached_verdict(&user.username, &key, user_id).await {
            Some(valid) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(valid)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.verify_and_cache(user, credentials, key.clone()).await
            }
        };

        drop(guard);
        drop(gate);
        let mut inflight = self.inflight.lock();
        if inflight.get(&key).is_some_and(|g| Arc::strong_count(g) == 1) {
            inflight.remove(&key);
        }

        result
    }

    async fn cached_verdict(&self, username: &str, key: &str, user_id: i64) -> Option<bool> {
        let verdicts = self.cache.get(username).await?;
        verdicts
            .lookup(key, user_id, now_unix_ms())
            .map(|entry| entry.valid)
    }

    async fn verify_and_cache(
        &self,
        user: &User,
        credentials: &BasicCredentials,
        key: String,
    ) -> Result<bool, AuthError> {
        self.hasher_calls.fetch_add(1, Ordering::Relaxed);
        let hasher = self.hasher.clone();
        let password = credentials.password.clone();
        let stored = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &stored))
            .await
            .map_err(|e| AuthError::Hasher(e.to_string()))?
            .inspect_err(|e| warn!(user_id = %user.id, error = %e, "password verification failed"))?;

        let now = now_unix_ms();
        let entry = AuthCacheEntry {
            user_hash: key,
            user_id: user.id.get(),
            valid,
            valid_until: now.saturating_add(self.ttl.as_millis() as i64),
        };
        let mut verdicts = self.cache.get(&user.username).await.unwrap_or_default();
        verdicts.record(entry, now);
        if let Err(e) = self
            .cache
            .set_with_ttl(&user.username, verdicts, self.ttl)
            .await
        {
            debug!(username = %user.username, error = %e, "auth cache write failed, verdict not cached");
        }

        Ok(valid)
    }
}
