//! Per-user sticky egress selection.
//!
//! The pool holds one [`Dialer`] per egress address. A user is bound to one
//! address for the rotation TTL so upstream sessions keep seeing the same
//! source; once the binding lapses, or its address leaves the pool, the next
//! lookup picks a new address at random.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollgate_cache::MemoryCache;
use tracing::{debug, info, warn};

use crate::dialer::{DialOptions, Dialer};
use crate::error::EgressError;
use crate::resolver::IpResolver;

#[derive(Default)]
struct PoolState {
    ips: Vec<IpAddr>,
    dialers: HashMap<IpAddr, Arc<Dialer>>,
}

/// Egress addresses with a prebuilt dialer each, plus `user → address` bindings.
pub struct DialerPool {
    state: RwLock<PoolState>,
    bindings: MemoryCache<IpAddr>,
    rotation_ttl: Duration,
    options: DialOptions,
    fallback: Arc<Dialer>,
}

impl DialerPool {
    pub fn new(rotation_ttl: Duration, options: DialOptions) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            bindings: MemoryCache::new(None),
            rotation_ttl,
            options,
            fallback: Arc::new(Dialer::system(options)),
        }
    }

    pub fn rotation_ttl(&self) -> Duration {
        self.rotation_ttl
    }

    /// Current egress addresses.
    pub fn ips(&self) -> Vec<IpAddr> {
        self.state.read().ips.clone()
    }

    /// Address `user_id` is currently bound to, if the binding is live.
    pub fn binding(&self, user_id: i64) -> Option<IpAddr> {
        self.bindings.get_sync(&binding_key(user_id))
    }

    /// Replace the address set and its dialers in one step.
    ///
    /// Bindings to addresses that left the set are ignored from now on and
    /// re-picked on the next lookup.
    pub fn set_pool(&self, ips: impl IntoIterator<Item = IpAddr>) {
        let mut ips: Vec<IpAddr> = ips.into_iter().collect();
        ips.sort();
        ips.dedup();

        let dialers = ips
            .iter()
            .map(|ip| (*ip, Arc::new(Dialer::bound(*ip, self.options))))
            .collect();
        let size = ips.len();

        *self.state.write() = PoolState { ips, dialers };
        tollgate_metrics::set_egress_pool_size(size);
        info!(size, "egress pool replaced");
    }

    /// Dialer for `user_id`.
    ///
    /// Returns the bound dialer while the binding is live and its address is
    /// still pooled, otherwise binds a random address for the rotation TTL.
    /// An empty pool yields the system dialer.
    pub fn get_dialer(&self, user_id: i64) -> Result<Arc<Dialer>, EgressError> {
        let state = self.state.read();
        if state.ips.is_empty() {
            return Ok(self.fallback.clone());
        }

        let key = binding_key(user_id);
        let ip = match self.bindings.get_sync(&key) {
            Some(ip) if state.dialers.contains_key(&ip) => ip,
            _ => {
                let ip = pick(&state.ips)?;
                self.bindings.insert(&key, ip, Some(self.rotation_ttl));
                debug!(user_id, %ip, "egress address bound");
                ip
            }
        };

        state
            .dialers
            .get(&ip)
            .cloned()
            .ok_or(EgressError::UnknownAddress(ip))
    }

    /// Bind `user_id` to a freshly picked address for `ttl`.
    ///
    /// Returns the chosen address, or `None` when the pool is empty.
    pub fn bind_dialer_to_user(&self, user_id: i64, ttl: Duration) -> Option<IpAddr> {
        let state = self.state.read();
        let ip = pick(&state.ips).ok()?;
        self.bindings.insert(&binding_key(user_id), ip, Some(ttl));
        debug!(user_id, %ip, ttl_secs = ttl.as_secs(), "egress address bound");
        Some(ip)
    }

    /// Poll `resolver` every `interval` and swap the pool when the address
    /// set changes. The first poll happens immediately.
    pub fn start_resolving(
        self: &Arc<Self>,
        resolver: Arc<dyn IpResolver>,
        shutdown: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match resolver.resolve().await {
                    Ok(mut ips) => {
                        ips.sort();
                        ips.dedup();
                        if ips != pool.ips() {
                            pool.set_pool(ips);
                        }
                    }
                    Err(e) => warn!(error = %e, "egress address discovery failed"),
                }
                pool.bindings.purge_expired();
            }
            debug!("egress resolver stopped");
        })
    }
}

#[inline]
fn binding_key(user_id: i64) -> String {
    user_id.to_string()
}

fn pick(ips: &[IpAddr]) -> Result<IpAddr, EgressError> {
    ips.choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| EgressError::Discovery("egress pool is empty".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn pool() -> DialerPool {
        DialerPool::new(Duration::from_secs(600), DialOptions::default())
    }

    #[test]
    fn empty_pool_returns_system_dialer() {
        let pool = pool();
        let dialer = pool.get_dialer(1).unwrap();
        assert_eq!(dialer.local_ip(), None);
        assert_eq!(pool.binding(1), None);
    }

    #[test]
    fn binding_is_sticky() {
        let pool = pool();
        pool.set_pool(ips(&["127.0.0.1", "127.0.0.2", "127.0.0.3", "127.0.0.4"]));

        let first = pool.get_dialer(42).unwrap().local_ip();
        assert!(first.is_some());
        for _ in 0..50 {
            assert_eq!(pool.get_dialer(42).unwrap().local_ip(), first);
        }
        assert_eq!(pool.binding(42), first);
    }

    #[test]
    fn replacement_drops_stale_bindings() {
        let pool = pool();
        pool.set_pool(ips(&["127.0.0.1"]));
        assert_eq!(
            pool.get_dialer(5).unwrap().local_ip(),
            Some("127.0.0.1".parse().unwrap())
        );

        let replacement = ips(&["127.0.0.2", "127.0.0.3"]);
        pool.set_pool(replacement.clone());
        for user in [5, 6, 7] {
            let ip = pool.get_dialer(user).unwrap().local_ip().unwrap();
            assert!(replacement.contains(&ip));
        }
    }

    #[test]
    fn surviving_binding_is_kept_across_replacement() {
        let pool = pool();
        pool.set_pool(ips(&["127.0.0.1"]));
        pool.get_dialer(9).unwrap();
        pool.set_pool(ips(&["127.0.0.1", "127.0.0.2"]));
        assert_eq!(
            pool.get_dialer(9).unwrap().local_ip(),
            Some("127.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn binding_expires_after_ttl() {
        let pool = DialerPool::new(Duration::from_millis(10), DialOptions::default());
        pool.set_pool(ips(&["127.0.0.1", "127.0.0.2"]));
        pool.get_dialer(3).unwrap();
        assert!(pool.binding(3).is_some());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(pool.binding(3), None);
        assert!(pool.get_dialer(3).unwrap().local_ip().is_some());
    }

    #[test]
    fn explicit_bind_uses_given_ttl() {
        let pool = pool();
        assert_eq!(pool.bind_dialer_to_user(1, Duration::from_secs(1)), None);

        pool.set_pool(ips(&["127.0.0.1"]));
        let ip = pool.bind_dialer_to_user(1, Duration::from_millis(10));
        assert_eq!(ip, Some("127.0.0.1".parse().unwrap()));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(pool.binding(1), None);
    }

    #[test]
    fn set_pool_dedups() {
        let pool = pool();
        pool.set_pool(ips(&["127.0.0.2", "127.0.0.1", "127.0.0.2"]));
        assert_eq!(pool.ips(), ips(&["127.0.0.1", "127.0.0.2"]));
    }

    #[tokio::test]
    async fn resolver_loop_tracks_changes() {
        let pool = Arc::new(pool());
        let resolver = Arc::new(StaticResolver::new(ips(&["127.0.0.1"])));
        let token = CancellationToken::new();
        let handle = pool.start_resolving(resolver.clone(), token.clone(), Duration::from_millis(10));

        wait_for(|| pool.ips() == ips(&["127.0.0.1"])).await;
        resolver.set(ips(&["127.0.0.2"]));
        wait_for(|| pool.ips() == ips(&["127.0.0.2"])).await;

        token.cancel();
        handle.await.unwrap();
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}
