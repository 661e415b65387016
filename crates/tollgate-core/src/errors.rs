//! Error type labels for metrics and logging.
//!
//! These constants keep error classification consistent across crates.

/// Malformed client request.
pub const ERROR_PROTOCOL: &str = "protocol";
/// I/O error.
pub const ERROR_IO: &str = "io";
/// DNS/address resolution error.
pub const ERROR_RESOLVE: &str = "resolve";
/// Upstream connect or transfer error.
pub const ERROR_UPSTREAM: &str = "upstream";
/// Authentication error.
pub const ERROR_AUTH: &str = "auth";
/// Request refused by the rate limiter.
pub const ERROR_RATE_LIMIT: &str = "rate_limit";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
