//! Egress address discovery and per-user source-address selection.
//!
//! An [`IpResolver`] reports the host's public addresses; the
//! [`DialerPool`] keeps one [`Dialer`] per address and pins each user to one
//! of them for a rotation period.

mod dialer;
mod error;
mod pool;
mod resolver;

pub use dialer::{DialOptions, Dialer};
pub use error::EgressError;
pub use pool::DialerPool;
pub use resolver::{IpResolver, SysinfoResolver, StaticResolver, is_public_ipv4};
