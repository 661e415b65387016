//! I/O primitives shared by the proxy data path.

mod prefixed;
mod relay;

pub use prefixed::PrefixedStream;
pub use relay::{NoOpMetrics, RelayMetrics, RelayStats, relay_bidirectional};
