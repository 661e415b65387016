//! Derivation of concrete rate limiter settings.

use std::time::Duration;

use tollgate_core::{CONNECTIONS_PER_USER, MAX_FILL_RATE_BYTES_PER_SEC};

use crate::types::RateLimitConfig;

const MIB: u64 = 1024 * 1024;

/// Fully resolved limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub capacity_bytes: u64,
    pub fill_rate_bytes_per_sec: u64,
    /// Concurrent connections per bucket.
    pub max_connections: u64,
    pub shard_count: usize,
    pub block_duration: Duration,
    pub cleanup_interval: Duration,
    /// Idle time after which an unused bucket is dropped.
    pub idle_timeout: Duration,
}

impl RateLimitConfig {
    /// Resolve against the machine's CPU count.
    pub fn resolve(&self) -> RateLimitSettings {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        self.resolve_with_cpus(cpus)
    }

    pub fn resolve_with_cpus(&self, cpus: usize) -> RateLimitSettings {
        let fill_rate_bytes_per_sec = match self.fill_rate_mbps {
            Some(mbps) => mbps.saturating_mul(1_000_000),
            None => (self.net_bandwidth_mbps.saturating_mul(1_000_000) / 8)
                .min(MAX_FILL_RATE_BYTES_PER_SEC),
        };

        RateLimitSettings {
            capacity_bytes: self.capacity_mb.saturating_mul(MIB),
            fill_rate_bytes_per_sec,
            max_connections: self
                .max_connections
                .unwrap_or_else(|| self.max_users.saturating_mul(CONNECTIONS_PER_USER)),
            shard_count: self.shard_count.unwrap_or(cpus.max(1) * 2),
            block_duration: Duration::from_secs(self.block_duration_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            idle_timeout: Duration::from_secs(self.bucket_idle_secs),
        }
    }
}
