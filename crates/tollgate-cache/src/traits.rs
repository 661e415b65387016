//! Cache trait definition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Typed key/value store with per-key TTL.
///
/// `get` never fails: an unreachable backend reads as a miss so callers fall
/// back to the authoritative source. Writes report backend failures so a
/// caller never mistakes a lost write for a stored one. No atomicity is
/// promised across a `get` followed by a `set`.
#[async_trait]
pub trait Cache<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Look up a live entry.
    async fn get(&self, key: &str) -> Option<V>;

    /// Store `value` with the cache's default TTL.
    async fn set(&self, key: &str, value: V) -> Result<(), CacheError>;

    /// Store `value` expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError>;

    /// Reset the lifetime of an existing entry to `ttl` from now.
    ///
    /// Expiring a missing key is not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Remove an entry. Subsequent `get`s miss.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait]
impl<V, C> Cache<V> for Arc<C>
where
    V: Send + Sync + 'static,
    C: Cache<V> + ?Sized,
{
    #[inline]
    async fn get(&self, key: &str) -> Option<V> {
        (**self).get(key).await
    }

    #[inline]
    async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        (**self).set(key, value).await
    }

    #[inline]
    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    #[inline]
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).expire(key, ttl).await
    }

    #[inline]
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }
}

/// Type-erased delete, so one invalidator can clear caches holding different value types.
#[async_trait]
pub trait Evict: Send + Sync {
    async fn evict(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait]
impl<C: Evict + ?Sized> Evict for Arc<C> {
    #[inline]
    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        (**self).evict(key).await
    }
}
