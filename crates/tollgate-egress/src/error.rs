//! Egress error types.

use std::io;
use std::net::IpAddr;

/// Errors from address discovery and outbound dialing.
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The target host did not resolve to a usable address.
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("connect to {0} timed out")]
    Timeout(String),

    /// A binding referred to an address that left the pool; fetch a fresh dialer.
    #[error("egress address {0} is not in the pool")]
    UnknownAddress(IpAddr),

    /// Interface enumeration failed.
    #[error("address discovery failed: {0}")]
    Discovery(String),
}

impl EgressError {
    /// Metric label for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Io(_) => tollgate_core::ERROR_IO,
            Self::Resolve(_) => tollgate_core::ERROR_RESOLVE,
            Self::Timeout(_) => tollgate_core::ERROR_TIMEOUT,
            Self::UnknownAddress(_) | Self::Discovery(_) => tollgate_core::ERROR_UPSTREAM,
        }
    }
}
