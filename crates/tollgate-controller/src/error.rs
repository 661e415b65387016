//! Controller error types.

use tollgate_auth::AuthError;
use tollgate_bus::BusError;
use tollgate_cache::CacheError;

/// Controller error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No user matches the event's reference.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown plan: {0}")]
    UnknownPlan(i64),

    #[error("store error: {0}")]
    Store(String),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

impl ControllerError {
    /// Create a store error from any error type.
    #[inline]
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<sqlx::Error> for ControllerError {
    fn from(err: sqlx::Error) -> Self {
        Self::store(err)
    }
}

impl From<ControllerError> for BusError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::Bus(inner) => inner,
            other => BusError::handler(other),
        }
    }
}
