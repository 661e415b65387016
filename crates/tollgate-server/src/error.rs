//! Server error types.

use tollgate_auth::AuthError;
use tollgate_egress::EgressError;
use tollgate_metrics::{
    ERROR_AUTH, ERROR_CONFIG, ERROR_IO, ERROR_PROTOCOL, ERROR_RATE_LIMIT, ERROR_RESOLVE,
    ERROR_TIMEOUT, ERROR_UPSTREAM,
};

use crate::http::HttpError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] HttpError),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("upstream: {0}")]
    Upstream(#[from] EgressError),
    #[error("config: {0}")]
    Config(String),
    #[error("rate limited")]
    RateLimited,
    #[error("timed out")]
    Timeout,
}

impl ServerError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Io(_) => ERROR_IO,
            ServerError::Http(_) => ERROR_PROTOCOL,
            ServerError::Auth(_) => ERROR_AUTH,
            ServerError::Upstream(EgressError::Resolve(_)) => ERROR_RESOLVE,
            ServerError::Upstream(_) => ERROR_UPSTREAM,
            ServerError::Config(_) => ERROR_CONFIG,
            ServerError::RateLimited => ERROR_RATE_LIMIT,
            ServerError::Timeout => ERROR_TIMEOUT,
        }
    }
}
