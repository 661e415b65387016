//! SQL plan store.
//!
//! ```sql
//! CREATE TABLE plans (
//!     id BIGINT PRIMARY KEY,
//!     name VARCHAR(128) NOT NULL,
//!     bandwidth_limit_bytes BIGINT NOT NULL,   -- 0 = unlimited
//!     duration_secs BIGINT NOT NULL
//! );
//! CREATE TABLE user_plans (
//!     user_id BIGINT PRIMARY KEY,
//!     plan_id BIGINT NOT NULL,
//!     valid_until BIGINT NOT NULL              -- unix seconds
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use time::OffsetDateTime;
use tollgate_cache::DatabaseType;

use crate::error::ControllerError;
use crate::plan::{Plan, PlanStore, UserPlan};

const SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS plans (
    id BIGINT PRIMARY KEY,
    name VARCHAR(128) NOT NULL,
    bandwidth_limit_bytes BIGINT NOT NULL,
    duration_secs BIGINT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS user_plans (
    user_id BIGINT PRIMARY KEY,
    plan_id BIGINT NOT NULL,
    valid_until BIGINT NOT NULL
)
"#,
];

const FIND_PLAN_PG: &str =
    "SELECT id, name, bandwidth_limit_bytes, duration_secs FROM plans WHERE id = $1";
const FIND_PLAN_OTHER: &str =
    "SELECT id, name, bandwidth_limit_bytes, duration_secs FROM plans WHERE id = ?";

const ACTIVE_PLAN_PG: &str = r#"
SELECT up.plan_id, p.bandwidth_limit_bytes, up.valid_until
FROM user_plans up JOIN plans p ON p.id = up.plan_id
WHERE up.user_id = $1 AND up.valid_until > $2
"#;
const ACTIVE_PLAN_OTHER: &str = r#"
SELECT up.plan_id, p.bandwidth_limit_bytes, up.valid_until
FROM user_plans up JOIN plans p ON p.id = up.plan_id
WHERE up.user_id = ? AND up.valid_until > ?
"#;

const UPSERT_PLAN_PG: &str = r#"
INSERT INTO plans (id, name, bandwidth_limit_bytes, duration_secs) VALUES ($1, $2, $3, $4)
ON CONFLICT (id) DO UPDATE SET name = excluded.name,
    bandwidth_limit_bytes = excluded.bandwidth_limit_bytes, duration_secs = excluded.duration_secs
"#;
const UPSERT_PLAN_SQLITE: &str = r#"
INSERT INTO plans (id, name, bandwidth_limit_bytes, duration_secs) VALUES (?, ?, ?, ?)
ON CONFLICT (id) DO UPDATE SET name = excluded.name,
    bandwidth_limit_bytes = excluded.bandwidth_limit_bytes, duration_secs = excluded.duration_secs
"#;
const UPSERT_PLAN_MYSQL: &str = r#"
INSERT INTO plans (id, name, bandwidth_limit_bytes, duration_secs) VALUES (?, ?, ?, ?)
ON DUPLICATE KEY UPDATE name = VALUES(name),
    bandwidth_limit_bytes = VALUES(bandwidth_limit_bytes), duration_secs = VALUES(duration_secs)
"#;

const ASSIGN_PG: &str = r#"
INSERT INTO user_plans (user_id, plan_id, valid_until) VALUES ($1, $2, $3)
ON CONFLICT (user_id) DO UPDATE SET plan_id = excluded.plan_id, valid_until = excluded.valid_until
"#;
const ASSIGN_SQLITE: &str = r#"
INSERT INTO user_plans (user_id, plan_id, valid_until) VALUES (?, ?, ?)
ON CONFLICT (user_id) DO UPDATE SET plan_id = excluded.plan_id, valid_until = excluded.valid_until
"#;
const ASSIGN_MYSQL: &str = r#"
INSERT INTO user_plans (user_id, plan_id, valid_until) VALUES (?, ?, ?)
ON DUPLICATE KEY UPDATE plan_id = VALUES(plan_id), valid_until = VALUES(valid_until)
"#;

fn from_unix(secs: i64) -> Result<OffsetDateTime, ControllerError> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(ControllerError::store)
}

/// Plan store over a sqlx `Any` pool.
#[derive(Debug, Clone)]
pub struct SqlPlanStore {
    pool: AnyPool,
    db_type: DatabaseType,
}

impl SqlPlanStore {
    pub fn new(pool: AnyPool, db_type: DatabaseType) -> Self {
        Self { pool, db_type }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create the plan tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), ControllerError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert or replace a plan definition.
    pub async fn upsert_plan(&self, plan: &Plan) -> Result<(), ControllerError> {
        let query = match self.db_type {
            DatabaseType::PostgreSQL => UPSERT_PLAN_PG,
            DatabaseType::SQLite => UPSERT_PLAN_SQLITE,
            DatabaseType::MySQL => UPSERT_PLAN_MYSQL,
        };
        sqlx::query(query)
            .bind(plan.id)
            .bind(plan.name.clone())
            .bind(plan.bandwidth_limit_bytes as i64)
            .bind(plan.duration.as_secs() as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_plan(&self, plan_id: i64) -> Result<Option<Plan>, ControllerError> {
        let query = self.db_type.pick(FIND_PLAN_PG, FIND_PLAN_OTHER);
        let Some(row) = sqlx::query(query)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(Plan {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            bandwidth_limit_bytes: row.try_get::<i64, _>("bandwidth_limit_bytes")?.max(0) as u64,
            duration: Duration::from_secs(row.try_get::<i64, _>("duration_secs")?.max(0) as u64),
        }))
    }
}

#[async_trait]
impl PlanStore for SqlPlanStore {
    async fn active_plan(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<UserPlan>, ControllerError> {
        let query = self.db_type.pick(ACTIVE_PLAN_PG, ACTIVE_PLAN_OTHER);
        let Some(row) = sqlx::query(query)
            .bind(user_id)
            .bind(now.unix_timestamp())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(UserPlan {
            plan_id: row.try_get("plan_id")?,
            bandwidth_limit_bytes: row.try_get::<i64, _>("bandwidth_limit_bytes")?.max(0) as u64,
            valid_until: from_unix(row.try_get("valid_until")?)?,
        }))
    }

    async fn assign_plan(
        &self,
        user_id: i64,
        plan_id: i64,
        now: OffsetDateTime,
    ) -> Result<UserPlan, ControllerError> {
        let plan = self
            .find_plan(plan_id)
            .await?
            .ok_or(ControllerError::UnknownPlan(plan_id))?;
        // Stored at second precision; keep the returned value consistent with reads.
        let valid_until = from_unix((now + plan.duration).unix_timestamp())?;

        let query = match self.db_type {
            DatabaseType::PostgreSQL => ASSIGN_PG,
            DatabaseType::SQLite => ASSIGN_SQLITE,
            DatabaseType::MySQL => ASSIGN_MYSQL,
        };
        sqlx::query(query)
            .bind(user_id)
            .bind(plan_id)
            .bind(valid_until.unix_timestamp())
            .execute(&self.pool)
            .await?;

        Ok(UserPlan {
            plan_id,
            bandwidth_limit_bytes: plan.bandwidth_limit_bytes,
            valid_until,
        })
    }
}
