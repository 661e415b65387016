//! tollgate proxy data plane.
//!
//! Accepts HTTP/1.1 proxy clients, authenticates them with Basic
//! credentials, then either tunnels `CONNECT` requests or forwards plain
//! HTTP requests from the user's egress address. Bytes moved per user are
//! reported to the bus as `UserConsumedTraffic` events.

mod codec;
mod error;
mod handler;
mod http;
mod pool;
mod rate_limit;
mod relay;
mod server;
mod state;
mod traffic;
mod util;

pub use error::ServerError;
pub use http::HttpError;
pub use pool::{BufferPool, PooledBuffer};
pub use rate_limit::{RateLimiter, RatePermit};
pub use server::{
    DEFAULT_SHUTDOWN_TIMEOUT, ProxyComponents, ProxyServer, dial_options, run_with_shutdown,
};
pub use state::ServerState;
pub use tokio_util::sync::CancellationToken;
pub use traffic::{TrafficEmitter, TrafficReporter};
