//! Shared SQL pool plumbing.
//!
//! Every SQL-backed component (remote cache, user store, bus, plan store)
//! talks to PostgreSQL, MySQL or SQLite through a sqlx `Any` pool. Placeholder
//! syntax differs between them, so queries are selected per [`DatabaseType`].

use std::time::Duration;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::error::CacheError;

/// Database type enum for query selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Detect database type from URL.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if url.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Pick between the `$n` and `?` placeholder variants of a query.
    #[inline]
    pub fn pick(self, pg: &'static str, other: &'static str) -> &'static str {
        match self {
            Self::PostgreSQL => pg,
            Self::MySQL | Self::SQLite => other,
        }
    }
}

/// Open an `Any` pool for `url`.
pub async fn connect(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<(AnyPool, DatabaseType), CacheError> {
    sqlx::any::install_default_drivers();

    let db_type = DatabaseType::from_url(url)
        .ok_or_else(|| CacheError::backend(format!("unsupported database URL scheme: {url}")))?;

    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await?;

    Ok((pool, db_type))
}

/// Current wall clock in unix milliseconds.
#[inline]
pub fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
