//! Default value functions for serde deserialization.
//!
//! These functions forward to constants defined in `tollgate_core::defaults`.

use tollgate_core::defaults;

/// Generate default value functions that forward to tollgate_core::defaults constants.
macro_rules! default_fns {
    ($($fn_name:ident => $const_name:ident : $ty:ty),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> $ty {
                defaults::$const_name
            }
        )*
    };
}

/// Generate default value functions that return String from &str constants.
macro_rules! default_string_fns {
    ($($fn_name:ident => $const_name:ident),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> String {
                defaults::$const_name.to_string()
            }
        )*
    };
}

default_fns! {
    default_listen_port           => DEFAULT_LISTEN_PORT: u16,
    default_connection_backlog    => DEFAULT_CONNECTION_BACKLOG: u32,
    default_max_connections       => DEFAULT_MAX_CLIENT_CONNECTIONS: usize,
    default_tcp_idle_timeout_secs => DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64,
    default_connect_timeout_secs  => DEFAULT_CONNECT_TIMEOUT_SECS: u64,
    default_request_timeout_secs  => DEFAULT_REQUEST_TIMEOUT_SECS: u64,
    default_shutdown_timeout_secs => DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64,
    default_max_header_bytes      => DEFAULT_MAX_HEADER_BYTES: usize,
    default_relay_buffer_size     => DEFAULT_RELAY_BUFFER_SIZE: usize,
    default_read_buffer_size      => DEFAULT_READ_BUFFER_SIZE: usize,
    default_buffer_pool_size      => DEFAULT_BUFFER_POOL_SIZE: usize,
    default_tcp_no_delay          => DEFAULT_TCP_NO_DELAY: bool,
    default_tcp_keepalive_secs    => DEFAULT_TCP_KEEPALIVE_SECS: u64,
    default_auth_validate_ttl_ms  => DEFAULT_AUTH_VALIDATE_TTL_MS: u64,
    default_user_cache_ttl_secs   => DEFAULT_USER_CACHE_TTL_SECS: u64,
    default_rotation_ttl_secs     => DEFAULT_EGRESS_ROTATION_TTL_SECS: u64,
    default_resolve_interval_secs => DEFAULT_EGRESS_RESOLVE_INTERVAL_SECS: u64,
    default_traffic_threshold     => DEFAULT_TRAFFIC_THRESHOLD_BYTES: u64,
    default_traffic_interval_secs => DEFAULT_TRAFFIC_INTERVAL_SECS: u64,
    default_capacity_mb           => DEFAULT_RATE_LIMIT_CAPACITY_MB: u64,
    default_net_bandwidth_mbps    => DEFAULT_NET_BANDWIDTH_MBPS: u64,
    default_max_users             => DEFAULT_MAX_USERS: u64,
    default_block_duration_secs   => DEFAULT_BLOCK_DURATION_SECS: u64,
    default_cleanup_interval_secs => DEFAULT_RATE_LIMIT_CLEANUP_SECS: u64,
    default_bucket_idle_secs      => DEFAULT_BUCKET_IDLE_SECS: u64,
    default_bus_poll_interval_ms  => DEFAULT_BUS_POLL_INTERVAL_MS: u64,
    default_db_max_connections    => DEFAULT_DB_MAX_CONNECTIONS: u32,
    default_db_acquire_timeout    => DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64,
}

default_string_fns! {
    default_listen_host       => DEFAULT_LISTEN_HOST,
    default_auth_realm        => DEFAULT_AUTH_REALM,
    default_auto_offset_reset => DEFAULT_AUTO_OFFSET_RESET,
}

pub(crate) fn default_true() -> bool {
    true
}
