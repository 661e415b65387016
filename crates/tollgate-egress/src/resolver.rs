//! Discovery of the host's egress addresses.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sysinfo::Networks;

use crate::error::EgressError;

/// Enumerates the addresses outbound connections may originate from.
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// Current egress addresses, sorted and deduplicated.
    async fn resolve(&self) -> Result<Vec<IpAddr>, EgressError>;
}

#[async_trait]
impl<R: IpResolver + ?Sized> IpResolver for Arc<R> {
    async fn resolve(&self) -> Result<Vec<IpAddr>, EgressError> {
        (**self).resolve().await
    }
}

/// Whether `ip` is routable on the public internet.
pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (64..128).contains(&b);
    let benchmarking = a == 198 && (b == 18 || b == 19);
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || benchmarking
        || a >= 240)
}

/// Public IPv4 addresses assigned to local interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoResolver;

impl SysinfoResolver {
    fn scan() -> Vec<IpAddr> {
        let networks = Networks::new_with_refreshed_list();
        let found: BTreeSet<IpAddr> = networks
            .list()
            .values()
            .flat_map(|data| data.ip_networks().iter().map(|net| net.addr))
            .filter(|addr| matches!(addr, IpAddr::V4(v4) if is_public_ipv4(*v4)))
            .collect();
        found.into_iter().collect()
    }
}

#[async_trait]
impl IpResolver for SysinfoResolver {
    async fn resolve(&self) -> Result<Vec<IpAddr>, EgressError> {
        tokio::task::spawn_blocking(Self::scan)
            .await
            .map_err(|e| EgressError::Discovery(e.to_string()))
    }
}

/// Fixed address list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticResolver {
    ips: RwLock<Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let resolver = Self::default();
        resolver.set(ips);
        resolver
    }

    pub fn set(&self, ips: impl IntoIterator<Item = IpAddr>) {
        let ips: BTreeSet<IpAddr> = ips.into_iter().collect();
        *self.ips.write() = ips.into_iter().collect();
    }
}

#[async_trait]
impl IpResolver for StaticResolver {
    async fn resolve(&self) -> Result<Vec<IpAddr>, EgressError> {
        Ok(self.ips.read().clone())
    }
}
