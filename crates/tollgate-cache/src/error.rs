//! Cache error types.

/// Cache error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Remote store failure (connection, query, timeout).
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(String),
}

impl CacheError {
    /// Create a backend error from any error type.
    #[inline]
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
