//! Authentication error types.

use tollgate_cache::CacheError;

/// Authentication error.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid credential")]
    Invalid,

    /// Valid credentials of a user on the restriction list.
    #[error("user is restricted")]
    Restricted,

    /// `Proxy-Authorization` value could not be decoded.
    #[error("malformed credentials: {0}")]
    Malformed(String),

    /// The password hasher failed (corrupt stored hash, bad parameters).
    #[error("hasher error: {0}")]
    Hasher(String),

    /// Backend error (database, cache, etc.).
    #[error("backend error: {0}")]
    Backend(String),
}

impl AuthError {
    /// Create a backend error from any error type.
    #[inline]
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }

    /// Whether the client should be challenged again with `407`.
    #[inline]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Invalid | Self::Restricted | Self::Malformed(_))
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}

impl From<CacheError> for AuthError {
    fn from(err: CacheError) -> Self {
        Self::backend(err)
    }
}
