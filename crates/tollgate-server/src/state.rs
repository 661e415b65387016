//! State shared by every client connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tollgate_auth::AuthBackend;
use tollgate_egress::DialerPool;

use crate::pool::BufferPool;
use crate::rate_limit::RateLimiter;
use crate::traffic::TrafficEmitter;

/// Shared server state for all connections.
#[derive(Clone)]
pub struct ServerState {
    pub auth: Arc<dyn AuthBackend>,
    pub dialers: Arc<DialerPool>,
    /// `None` disables per-user rate limiting.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub traffic: TrafficEmitter,
    pub buffers: Arc<BufferPool>,
    /// Complete `407` response sent to unauthenticated clients.
    pub challenge: Bytes,
    pub max_header_bytes: usize,
    /// Deadline for a client to deliver one request head.
    pub request_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub relay_buffer_size: usize,
}

/// `407` response challenging for Basic credentials in `realm`.
pub fn challenge_response(realm: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"{realm}\"\r\n\r\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_realm_challenge_is_exact() {
        assert_eq!(
            &challenge_response(tollgate_core::DEFAULT_AUTH_REALM)[..],
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n"
        );
    }
}
