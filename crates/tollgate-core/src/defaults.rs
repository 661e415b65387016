//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Listener Defaults
// ============================================================================

/// Default proxy listen host.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
/// Default proxy listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;
/// Default cap on concurrently served client connections.
pub const DEFAULT_MAX_CLIENT_CONNECTIONS: usize = 10_000;

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default idle timeout of a spliced tunnel in seconds.
pub const DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64 = 600;
/// Default upstream connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default time to wait for the next request head on a keep-alive connection.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Buffer/Size Defaults
// ============================================================================

/// Default maximum size of an HTTP request or response head.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;
/// Maximum number of header fields parsed per head.
pub const MAX_HEADER_COUNT: usize = 96;
/// Default relay buffer size.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32 * 1024;
/// Default capacity of a pooled client read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
/// Default number of idle read buffers retained by the pool.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 256;

// ============================================================================
// TCP Socket Defaults
// ============================================================================

/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default TCP Keep-Alive interval in seconds (0 = disabled).
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 300;

// ============================================================================
// Auth Defaults
// ============================================================================

/// Default lifetime of a cached credential verdict in milliseconds.
pub const DEFAULT_AUTH_VALIDATE_TTL_MS: u64 = 300_000;
/// Default lifetime of a cached user aggregate in seconds.
pub const DEFAULT_USER_CACHE_TTL_SECS: u64 = 300;
/// Maximum number of candidate verdicts cached per username.
pub const MAX_CACHED_CANDIDATES: usize = 4;
/// Realm advertised in `Proxy-Authenticate`.
pub const DEFAULT_AUTH_REALM: &str = "Proxy";

// ============================================================================
// Egress Defaults
// ============================================================================

/// Default lifetime of a user's egress IP binding in seconds.
pub const DEFAULT_EGRESS_ROTATION_TTL_SECS: u64 = 600;
/// Default interval between public IP scans in seconds.
pub const DEFAULT_EGRESS_RESOLVE_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Traffic Defaults
// ============================================================================

/// Default byte threshold that forces a traffic emission.
pub const DEFAULT_TRAFFIC_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
/// Default maximum time between two traffic emissions in seconds.
pub const DEFAULT_TRAFFIC_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Rate Limit Defaults
// ============================================================================

/// Default bucket capacity in MiB.
pub const DEFAULT_RATE_LIMIT_CAPACITY_MB: u64 = 100;
/// Default NIC bandwidth in Mbit/s used to derive the fill rate.
pub const DEFAULT_NET_BANDWIDTH_MBPS: u64 = 1000;
/// Upper bound of the derived fill rate (1 Gbit/s in bytes).
pub const MAX_FILL_RATE_BYTES_PER_SEC: u64 = 125_000_000;
/// Default sizing hint for the number of users.
pub const DEFAULT_MAX_USERS: u64 = 100;
/// Concurrent connections granted per expected user.
pub const CONNECTIONS_PER_USER: u64 = 25;
/// Default block period after a rejected `allow`, in seconds.
pub const DEFAULT_BLOCK_DURATION_SECS: u64 = 30;
/// Default bucket cleanup interval in seconds.
pub const DEFAULT_RATE_LIMIT_CLEANUP_SECS: u64 = 60;
/// Idle time after which an unused bucket is dropped, in seconds.
pub const DEFAULT_BUCKET_IDLE_SECS: u64 = 300;

// ============================================================================
// Bus Defaults
// ============================================================================

/// Default consumer offset reset policy.
pub const DEFAULT_AUTO_OFFSET_RESET: &str = "earliest";
/// Default poll interval of the SQL bus consumer in milliseconds.
pub const DEFAULT_BUS_POLL_INTERVAL_MS: u64 = 200;
/// Maximum rows fetched per SQL bus poll.
pub const DEFAULT_BUS_BATCH_SIZE: i64 = 100;
/// Maximum length of an event type tag.
pub const MAX_EVENT_TYPE_LEN: usize = 100;

// ============================================================================
// Database Defaults
// ============================================================================

/// Default maximum pool connections.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
/// Default SQL acquire timeout in seconds.
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
