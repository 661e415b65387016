//! Bus error types.

use tollgate_cache::CacheError;

/// Message bus error.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus was closed; no further events will be delivered.
    #[error("bus closed")]
    Closed,

    /// `consume` called before `subscribe`.
    #[error("not subscribed to any topic")]
    NotSubscribed,

    /// Event type tag longer than allowed.
    #[error("event type too long: {0} bytes")]
    EventTypeTooLong(usize),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport failure (database, network).
    #[error("bus backend error: {0}")]
    Backend(String),

    /// A handler failed to process an event.
    #[error("handler error: {0}")]
    Handler(String),
}

impl BusError {
    /// Create a backend error from any error type.
    #[inline]
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }

    /// Create a handler error from any error type.
    #[inline]
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        Self::Handler(err.to_string())
    }
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}

impl From<CacheError> for BusError {
    fn from(err: CacheError) -> Self {
        Self::backend(err)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
