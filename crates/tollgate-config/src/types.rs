//! Configuration type definitions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which top-level component the process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Proxy data plane only.
    Proxy,
    /// Plan controller only: traffic folding, restrictions, plan assignment.
    Controller,
    /// Proxy and controller in one process.
    #[default]
    Standalone,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Controller => "controller",
            Self::Standalone => "standalone",
        }
    }

    pub fn runs_proxy(self) -> bool {
        matches!(self, Self::Proxy | Self::Standalone)
    }

    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::Standalone)
    }

    /// Bounded contexts this mode produces to or consumes from.
    pub fn bus_contexts(self) -> &'static [&'static str] {
        match self {
            Self::Proxy => &["PROXY", "USERS"],
            Self::Controller => &["PROXY", "PLAN", "BILLING", "USERS"],
            Self::Standalone => &["PROXY", "PLAN", "BILLING", "USERS"],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "controller" | "plan-controller" => Ok(Self::Controller),
            "standalone" | "all" => Ok(Self::Standalone),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: u32,
    /// Concurrent client connections; further accepts wait for a slot.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Wait for the next request head on a keep-alive connection.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Idle read buffers kept for reuse.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,
    #[serde(default = "default_auth_realm")]
    pub realm: String,
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl ProxyConfig {
    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            connection_backlog: default_connection_backlog(),
            max_connections: default_max_connections(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
            relay_buffer_size: default_relay_buffer_size(),
            read_buffer_size: default_read_buffer_size(),
            buffer_pool_size: default_buffer_pool_size(),
            realm: default_auth_realm(),
            tcp: TcpConfig::default(),
        }
    }
}

/// TCP socket options for client and upstream sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm (TCP_NODELAY).
    #[serde(default = "default_tcp_no_delay")]
    pub no_delay: bool,
    /// Keep-alive idle time in seconds (0 = disabled).
    #[serde(default = "default_tcp_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: default_tcp_no_delay(),
            keepalive_secs: default_tcp_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Bind outbound connections to discovered public addresses.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lifetime of a user's address binding.
    #[serde(default = "default_rotation_ttl_secs")]
    pub rotation_ttl_secs: u64,
    #[serde(default = "default_resolve_interval_secs")]
    pub resolve_interval_secs: u64,
    /// Fixed egress addresses; interface discovery is used when empty.
    #[serde(default)]
    pub static_ips: Vec<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_ttl_secs: default_rotation_ttl_secs(),
            resolve_interval_secs: default_resolve_interval_secs(),
            static_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of cached credential verdicts, positive and negative alike.
    #[serde(default = "default_auth_validate_ttl_ms")]
    pub validate_ttl_ms: u64,
    /// Lifetime of cached user records.
    #[serde(default = "default_user_cache_ttl_secs")]
    pub user_cache_ttl_secs: u64,
    /// Users served when no database is configured.
    ///
    /// ```toml
    /// [[auth.users]]
    /// id = 7
    /// username = "user"
    /// email = "user@example.com"
    /// password = "pass"
    /// ```
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            validate_ttl_ms: default_auth_validate_ttl_ms(),
            user_cache_ttl_secs: default_user_cache_ttl_secs(),
            users: Vec::new(),
        }
    }
}

/// Statically configured user. Exactly one of `password` / `password_hash` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    /// Cleartext, hashed at startup.
    #[serde(default)]
    pub password: Option<String>,
    /// Argon2 PHC string.
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Plan limit in bytes for the memory plan store (0 = unlimited).
    #[serde(default)]
    pub plan_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Accumulated bytes that force an emission.
    #[serde(default = "default_traffic_threshold")]
    pub threshold_bytes: u64,
    /// Longest time between emissions of a busy connection.
    #[serde(default = "default_traffic_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_traffic_threshold(),
            interval_secs: default_traffic_interval_secs(),
        }
    }
}

/// Rate limiter inputs; see [`RateLimitConfig::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket capacity in MiB.
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: u64,
    /// NIC bandwidth in Mbit/s.
    #[serde(default = "default_net_bandwidth_mbps")]
    pub net_bandwidth_mbps: u64,
    /// Explicit fill rate in MB/s, bypassing the bandwidth derivation.
    #[serde(default)]
    pub fill_rate_mbps: Option<u64>,
    #[serde(default = "default_max_users")]
    pub max_users: u64,
    /// Explicit per-bucket connection cap.
    #[serde(default)]
    pub max_connections: Option<u64>,
    /// Defaults to twice the available CPUs.
    #[serde(default)]
    pub shard_count: Option<usize>,
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_bucket_idle_secs")]
    pub bucket_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_mb: default_capacity_mb(),
            net_bandwidth_mbps: default_net_bandwidth_mbps(),
            fill_rate_mbps: None,
            max_users: default_max_users(),
            max_connections: None,
            shard_count: None,
            block_duration_secs: default_block_duration_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            bucket_idle_secs: default_bucket_idle_secs(),
        }
    }
}

/// Where shared caches (restrictions, traffic, plans) live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Sql,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Database URL of the remote cache; falls back to `database.url`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Users, plans and (by default) the bus and remote cache.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_db_max_connections(),
            acquire_timeout_secs: default_db_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusTransport {
    /// In-process broker; only meaningful in standalone mode.
    #[default]
    Memory,
    /// Outbox tables in a SQL database.
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub transport: BusTransport,
    #[serde(default = "default_bus_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub proxy: BusContextConfig,
    #[serde(default)]
    pub plan: BusContextConfig,
    #[serde(default)]
    pub billing: BusContextConfig,
    #[serde(default)]
    pub users: BusContextConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: BusTransport::default(),
            poll_interval_ms: default_bus_poll_interval_ms(),
            proxy: BusContextConfig::default(),
            plan: BusContextConfig::default(),
            billing: BusContextConfig::default(),
            users: BusContextConfig::default(),
        }
    }
}

impl BusConfig {
    /// Settings of a bounded context by tag (`PROXY`, `PLAN`, `BILLING`, `USERS`).
    pub fn context(&self, name: &str) -> Option<&BusContextConfig> {
        match name.to_ascii_uppercase().as_str() {
            "PROXY" => Some(&self.proxy),
            "PLAN" => Some(&self.plan),
            "BILLING" => Some(&self.billing),
            "USERS" => Some(&self.users),
            _ => None,
        }
    }

    pub fn context_mut(&mut self, name: &str) -> Option<&mut BusContextConfig> {
        match name.to_ascii_uppercase().as_str() {
            "PROXY" => Some(&mut self.proxy),
            "PLAN" => Some(&mut self.plan),
            "BILLING" => Some(&mut self.billing),
            "USERS" => Some(&mut self.users),
            _ => None,
        }
    }
}

/// One bounded context's transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusContextConfig {
    /// Transport address; for the SQL transport a database URL.
    #[serde(default)]
    pub bootstrap_servers: Option<String>,
    /// Consumer group; defaults to `tollgate-{mode}`.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Topic name; defaults to the context tag.
    #[serde(default)]
    pub topic: Option<String>,
}

impl Default for BusContextConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            group_id: None,
            auto_offset_reset: default_auto_offset_reset(),
            topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus exporter address; disabled when unset.
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Option<String>,
    /// Log format: json, pretty, or compact. Default: pretty.
    pub format: Option<String>,
    /// Output target: stdout or stderr. Default: stderr.
    pub output: Option<String>,
    /// Per-module log level filters (e.g., {"tollgate_auth": "debug", "sqlx": "warn"}).
    #[serde(default)]
    pub filters: HashMap<String, String>,
}
