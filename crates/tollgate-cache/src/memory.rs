//! In-process TTL cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CacheError;
use crate::traits::{Cache, Evict};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` = lives until deleted.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Stored entries, including expired ones not yet purged.
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Map protected by a readers/writer lock. Expired entries read as misses and
/// are dropped on the next write to the same key or by [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V> MemoryCache<V> {
    /// Create a cache; `default_ttl` applies to [`Cache::set`], `None` keeps entries forever.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Synchronous store; `None` keeps the entry until deleted.
    pub fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .insert(key.to_owned(), Entry { value, expires_at });
    }
}

impl<V: Clone> MemoryCache<V> {
    /// Synchronous lookup used by callers outside an async context.
    pub fn get_sync(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(key)
            && entry.is_live(Instant::now())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        drop(entries);

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }
}

#[async_trait]
impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.get_sync(key)
    }

    async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.insert(key, value, self.default_ttl);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, Some(ttl));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[async_trait]
impl<V> Evict for MemoryCache<V>
where
    V: Send + Sync + 'static,
{
    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }
}
