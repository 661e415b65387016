//! Remote TTL cache stored in a SQL table.
//!
//! Values are encoded with bincode into a binary column. Several processes
//! pointing at the same database share entries, which is what lets the
//! controller's restriction writes reach every proxy instance.
//!
//! ```sql
//! CREATE TABLE cache_entries (
//!     namespace VARCHAR(64) NOT NULL,
//!     cache_key VARCHAR(255) NOT NULL,
//!     value BLOB NOT NULL,            -- BYTEA on PostgreSQL
//!     expires_at BIGINT,              -- unix ms, NULL = no expiry
//!     PRIMARY KEY (namespace, cache_key)
//! );
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{AnyPool, Row};
use tracing::warn;

use crate::db::{DatabaseType, now_unix_ms};
use crate::error::CacheError;
use crate::traits::{Cache, Evict};

const SCHEMA_PG: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace VARCHAR(64) NOT NULL,
    cache_key VARCHAR(255) NOT NULL,
    value BYTEA NOT NULL,
    expires_at BIGINT,
    PRIMARY KEY (namespace, cache_key)
)
"#;

const SCHEMA_OTHER: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace VARCHAR(64) NOT NULL,
    cache_key VARCHAR(255) NOT NULL,
    value BLOB NOT NULL,
    expires_at BIGINT,
    PRIMARY KEY (namespace, cache_key)
)
"#;

const GET_PG: &str =
    "SELECT value, expires_at FROM cache_entries WHERE namespace = $1 AND cache_key = $2";
const GET_OTHER: &str =
    "SELECT value, expires_at FROM cache_entries WHERE namespace = ? AND cache_key = ?";

const UPSERT_PG: &str = r#"
INSERT INTO cache_entries (namespace, cache_key, value, expires_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (namespace, cache_key)
DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
"#;

const UPSERT_SQLITE: &str = r#"
INSERT INTO cache_entries (namespace, cache_key, value, expires_at)
VALUES (?, ?, ?, ?)
ON CONFLICT (namespace, cache_key)
DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
"#;

const UPSERT_MYSQL: &str = r#"
INSERT INTO cache_entries (namespace, cache_key, value, expires_at)
VALUES (?, ?, ?, ?)
ON DUPLICATE KEY UPDATE value = VALUES(value), expires_at = VALUES(expires_at)
"#;

const EXPIRE_PG: &str =
    "UPDATE cache_entries SET expires_at = $1 WHERE namespace = $2 AND cache_key = $3";
const EXPIRE_OTHER: &str =
    "UPDATE cache_entries SET expires_at = ? WHERE namespace = ? AND cache_key = ?";

const DELETE_PG: &str = "DELETE FROM cache_entries WHERE namespace = $1 AND cache_key = $2";
const DELETE_OTHER: &str = "DELETE FROM cache_entries WHERE namespace = ? AND cache_key = ?";

const PURGE_PG: &str =
    "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= $1";
const PURGE_OTHER: &str =
    "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?";

/// SQL-backed cache for one namespace.
pub struct SqlCache<V> {
    pool: AnyPool,
    db_type: DatabaseType,
    namespace: String,
    default_ttl: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for SqlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCache")
            .field("db_type", &self.db_type)
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<V> Clone for SqlCache<V> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            db_type: self.db_type,
            namespace: self.namespace.clone(),
            default_ttl: self.default_ttl,
            _value: PhantomData,
        }
    }
}

impl<V> SqlCache<V> {
    pub fn new(pool: AnyPool, db_type: DatabaseType, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            db_type,
            namespace: namespace.into(),
            default_ttl: None,
            _value: PhantomData,
        }
    }

    /// TTL applied by [`Cache::set`]; `None` keeps entries until deleted.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create the backing table when missing.
    pub async fn ensure_schema(&self) -> Result<(), CacheError> {
        let ddl = self.db_type.pick(SCHEMA_PG, SCHEMA_OTHER);
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete expired rows of every namespace.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(self.db_type.pick(PURGE_PG, PURGE_OTHER))
            .bind(now_unix_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn deadline(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| now_unix_ms().saturating_add(ttl.as_millis() as i64))
    }
}

impl<V: DeserializeOwned> SqlCache<V> {
    /// Lookup that surfaces backend errors instead of reading them as a miss.
    pub async fn try_get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let row = sqlx::query(self.db_type.pick(GET_PG, GET_OTHER))
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| at <= now_unix_ms()) {
            return Ok(None);
        }

        let raw: Vec<u8> = row.try_get("value")?;
        Ok(Some(bincode::deserialize(&raw)?))
    }
}

impl<V: Serialize> SqlCache<V> {
    async fn upsert(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let raw = bincode::serialize(value)?;
        let query = match self.db_type {
            DatabaseType::PostgreSQL => UPSERT_PG,
            DatabaseType::SQLite => UPSERT_SQLITE,
            DatabaseType::MySQL => UPSERT_MYSQL,
        };

        sqlx::query(query)
            .bind(&self.namespace)
            .bind(key)
            .bind(raw)
            .bind(Self::deadline(ttl))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<V> Cache<V> for SqlCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(namespace = %self.namespace, key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.upsert(key, &value, self.default_ttl).await
    }

    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        self.upsert(key, &value, Some(ttl)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        sqlx::query(self.db_type.pick(EXPIRE_PG, EXPIRE_OTHER))
            .bind(Self::deadline(Some(ttl)))
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.evict(key).await
    }
}

#[async_trait]
impl<V> Evict for SqlCache<V> {
    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query(self.db_type.pick(DELETE_PG, DELETE_OTHER))
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
