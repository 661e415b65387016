//! SQL user store.
//!
//! Expects a table maintained by the user-management service:
//!
//! ```sql
//! CREATE TABLE users (
//!     id BIGINT PRIMARY KEY,
//!     username VARCHAR(64) NOT NULL UNIQUE,   -- lowercase
//!     email VARCHAR(255) NOT NULL UNIQUE,
//!     password_hash VARCHAR(255) NOT NULL     -- argon2id PHC string
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tollgate_cache::DatabaseType;

use super::traits::UserStore;
use crate::error::AuthError;
use crate::user::{User, UserId, normalize_username};

const FIND_BY_USERNAME_PG: &str =
    "SELECT id, username, email, password_hash FROM users WHERE username = $1";
const FIND_BY_USERNAME_OTHER: &str =
    "SELECT id, username, email, password_hash FROM users WHERE username = ?";

const FIND_BY_ID_PG: &str = "SELECT id, username, email, password_hash FROM users WHERE id = $1";
const FIND_BY_ID_OTHER: &str = "SELECT id, username, email, password_hash FROM users WHERE id = ?";

const FIND_BY_EMAIL_PG: &str =
    "SELECT id, username, email, password_hash FROM users WHERE LOWER(email) = LOWER($1)";
const FIND_BY_EMAIL_OTHER: &str =
    "SELECT id, username, email, password_hash FROM users WHERE LOWER(email) = LOWER(?)";

/// User store over a sqlx `Any` pool (PostgreSQL, MySQL or SQLite).
#[derive(Debug, Clone)]
pub struct SqlUserStore {
    pool: AnyPool,
    db_type: DatabaseType,
}

impl SqlUserStore {
    pub fn new(pool: AnyPool, db_type: DatabaseType) -> Self {
        Self { pool, db_type }
    }

    /// Connect a dedicated pool.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, AuthError> {
        let (pool, db_type) =
            tollgate_cache::db::connect(url, max_connections, acquire_timeout).await?;
        Ok(Self { pool, db_type })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn parse_row(row: AnyRow) -> Result<User, AuthError> {
        Ok(User {
            id: UserId(row.try_get("id")?),
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
        })
    }

    async fn fetch_one(
        &self,
        query: &'static str,
        bind: impl sqlx::Encode<'static, sqlx::Any> + sqlx::Type<sqlx::Any> + Send + 'static,
    ) -> Result<Option<User>, AuthError> {
        sqlx::query(query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::parse_row)
            .transpose()
    }
}

#[async_trait]
impl UserStore for SqlUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let query = self
            .db_type
            .pick(FIND_BY_USERNAME_PG, FIND_BY_USERNAME_OTHER);
        self.fetch_one(query, normalize_username(username)).await
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AuthError> {
        let query = self.db_type.pick(FIND_BY_ID_PG, FIND_BY_ID_OTHER);
        self.fetch_one(query, id.get()).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let query = self.db_type.pick(FIND_BY_EMAIL_PG, FIND_BY_EMAIL_OTHER);
        self.fetch_one(query, email.trim().to_owned()).await
    }
}
