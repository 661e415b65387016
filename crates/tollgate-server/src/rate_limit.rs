//! Per `(user, target)` token buckets.
//!
//! Buckets live in `shard_count` maps, each behind its own mutex; a key is
//! always served by the same shard, so every `allow`/`done` on one bucket is
//! totally ordered. A background task clears lapsed blocks and evicts idle
//! buckets.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tollgate_config::RateLimitSettings;
use tracing::debug;

struct TokenBucket {
    available: f64,
    last_refill: Instant,
    active: u64,
    blocked_until: Option<Instant>,
    last_used: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            available: capacity,
            last_refill: now,
            active: 0,
            blocked_until: None,
            last_used: now,
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    fn refill(&mut self, now: Instant, fill_rate: f64, capacity: f64) {
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.available = (self.available + elapsed * fill_rate).min(capacity);
            self.last_refill = now;
        }
    }
}

type Shard = Mutex<HashMap<String, TokenBucket>>;

struct Shards {
    shards: Box<[Shard]>,
    settings: RateLimitSettings,
}

impl Shards {
    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn cleanup(&self, now: Instant) -> usize {
        let idle = self.settings.idle_timeout;
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, bucket| {
                if !bucket.is_blocked(now) {
                    bucket.blocked_until = None;
                }
                bucket.active > 0
                    || bucket.blocked_until.is_some()
                    || now.saturating_duration_since(bucket.last_used) < idle
            });
            removed += before - map.len();
        }
        removed
    }
}

fn bucket_key(user_id: i64, target: &str) -> String {
    format!("{user_id}|{target}")
}

/// Sharded token-bucket limiter with a per-bucket concurrency cap.
pub struct RateLimiter {
    inner: Arc<Shards>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let shards = (0..settings.shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(Shards { shards, settings }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.inner.settings
    }

    /// Admit a request costing `tokens` bytes.
    #[inline]
    pub fn allow(&self, user_id: i64, target: &str, tokens: u64) -> bool {
        self.allow_at(user_id, target, tokens, Instant::now())
    }

    /// [`allow`](Self::allow) evaluated at `now`.
    ///
    /// A blocked bucket refuses without refilling. Hitting the concurrency
    /// cap or running dry starts a new block period.
    pub fn allow_at(&self, user_id: i64, target: &str, tokens: u64, now: Instant) -> bool {
        let settings = &self.inner.settings;
        let capacity = settings.capacity_bytes as f64;
        let key = bucket_key(user_id, target);

        let mut map = self.inner.shard(&key).lock();
        let bucket = map
            .entry(key)
            .or_insert_with(|| TokenBucket::full(capacity, now));
        bucket.last_used = now;

        if bucket.is_blocked(now) {
            return false;
        }
        bucket.blocked_until = None;
        bucket.refill(now, settings.fill_rate_bytes_per_sec as f64, capacity);

        if bucket.active >= settings.max_connections {
            bucket.blocked_until = Some(now + settings.block_duration);
            debug!(user_id, target, active = bucket.active, "concurrency cap reached");
            return false;
        }
        if bucket.available >= tokens as f64 {
            bucket.available -= tokens as f64;
            bucket.active += 1;
            true
        } else {
            bucket.blocked_until = Some(now + settings.block_duration);
            debug!(user_id, target, tokens, "bucket exhausted");
            false
        }
    }

    /// Release one admitted request.
    pub fn done(&self, user_id: i64, target: &str) {
        let key = bucket_key(user_id, target);
        let mut map = self.inner.shard(&key).lock();
        if let Some(bucket) = map.get_mut(&key) {
            bucket.active = bucket.active.saturating_sub(1);
            bucket.last_used = Instant::now();
        }
    }

    /// `allow` returning a permit that calls `done` when dropped.
    pub fn acquire(self: &Arc<Self>, user_id: i64, target: &str, tokens: u64) -> Option<RatePermit> {
        self.allow(user_id, target, tokens).then(|| RatePermit {
            limiter: self.clone(),
            user_id,
            target: target.to_string(),
        })
    }

    /// Bytes currently available in a bucket, without refilling.
    pub fn available(&self, user_id: i64, target: &str) -> Option<u64> {
        let key = bucket_key(user_id, target);
        let map = self.inner.shard(&key).lock();
        map.get(&key).map(|b| b.available as u64)
    }

    /// In-flight requests of a bucket.
    pub fn active(&self, user_id: i64, target: &str) -> u64 {
        let key = bucket_key(user_id, target);
        let map = self.inner.shard(&key).lock();
        map.get(&key).map_or(0, |b| b.active)
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear lapsed blocks and drop idle buckets. Returns the number dropped.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        self.inner.cleanup(now)
    }

    /// Start the background cleanup task.
    pub fn start_cleanup_task(&self, interval: Duration) {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("rate limiter cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = inner.cleanup(Instant::now());
                        if removed > 0 {
                            debug!(removed, "idle rate limit buckets evicted");
                        }
                    }
                }
            }
        });
    }

    /// Signal shutdown to cleanup task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Admission of one request; releases its slot on drop.
pub struct RatePermit {
    limiter: Arc<RateLimiter>,
    user_id: i64,
    target: String,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.limiter.done(self.user_id, &self.target);
    }
}
