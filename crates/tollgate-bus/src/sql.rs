//! Durable bus over a SQL outbox table.
//!
//! Producers append rows to `outbox_events`; consumers poll rows above their
//! group's committed offset per topic. Offsets live in `bus_offsets` and are
//! committed once a fetched batch has been handed out completely, and on
//! [`close`](MessageBus::close). Delivery is at-least-once across restarts.
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!     id BIGSERIAL PRIMARY KEY,
//!     topic VARCHAR(128) NOT NULL,
//!     event_type VARCHAR(100) NOT NULL,
//!     payload TEXT NOT NULL,
//!     published BOOLEAN NOT NULL DEFAULT TRUE,
//!     created_at BIGINT NOT NULL
//! );
//! CREATE TABLE bus_offsets (
//!     group_id VARCHAR(128) NOT NULL,
//!     topic VARCHAR(128) NOT NULL,
//!     last_id BIGINT NOT NULL,
//!     PRIMARY KEY (group_id, topic)
//! );
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;
use tollgate_cache::DatabaseType;
use tollgate_cache::db::now_unix_ms;
use tollgate_core::{DEFAULT_BUS_BATCH_SIZE, DEFAULT_BUS_POLL_INTERVAL_MS};
use tracing::{debug, trace};

use crate::context::OffsetReset;
use crate::error::BusError;
use crate::events::EventEnvelope;
use crate::traits::MessageBus;

const OUTBOX_PG: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id BIGSERIAL PRIMARY KEY,
    topic VARCHAR(128) NOT NULL,
    event_type VARCHAR(100) NOT NULL,
    payload TEXT NOT NULL,
    published BOOLEAN NOT NULL DEFAULT TRUE,
    created_at BIGINT NOT NULL
)
"#;

const OUTBOX_MYSQL: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    topic VARCHAR(128) NOT NULL,
    event_type VARCHAR(100) NOT NULL,
    payload TEXT NOT NULL,
    published BOOLEAN NOT NULL DEFAULT TRUE,
    created_at BIGINT NOT NULL
)
"#;

const OUTBOX_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    published INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
)
"#;

const OFFSETS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS bus_offsets (
    group_id VARCHAR(128) NOT NULL,
    topic VARCHAR(128) NOT NULL,
    last_id BIGINT NOT NULL,
    PRIMARY KEY (group_id, topic)
)
"#;

const INSERT_PG: &str = r#"
INSERT INTO outbox_events (topic, event_type, payload, published, created_at)
VALUES ($1, $2, $3, $4, $5)
"#;
const INSERT_OTHER: &str = r#"
INSERT INTO outbox_events (topic, event_type, payload, published, created_at)
VALUES (?, ?, ?, ?, ?)
"#;

const FETCH_PG: &str = r#"
SELECT id, event_type, payload, published FROM outbox_events
WHERE topic = $1 AND id > $2
ORDER BY id
LIMIT $3
"#;
const FETCH_OTHER: &str = r#"
SELECT id, event_type, payload, published FROM outbox_events
WHERE topic = ? AND id > ?
ORDER BY id
LIMIT ?
"#;

const TAIL_PG: &str = "SELECT COALESCE(MAX(id), 0) AS last_id FROM outbox_events WHERE topic = $1";
const TAIL_OTHER: &str = "SELECT COALESCE(MAX(id), 0) AS last_id FROM outbox_events WHERE topic = ?";

const LOAD_OFFSET_PG: &str = "SELECT last_id FROM bus_offsets WHERE group_id = $1 AND topic = $2";
const LOAD_OFFSET_OTHER: &str = "SELECT last_id FROM bus_offsets WHERE group_id = ? AND topic = ?";

const COMMIT_PG: &str = r#"
INSERT INTO bus_offsets (group_id, topic, last_id) VALUES ($1, $2, $3)
ON CONFLICT (group_id, topic) DO UPDATE SET last_id = excluded.last_id
"#;
const COMMIT_SQLITE: &str = r#"
INSERT INTO bus_offsets (group_id, topic, last_id) VALUES (?, ?, ?)
ON CONFLICT (group_id, topic) DO UPDATE SET last_id = excluded.last_id
"#;
const COMMIT_MYSQL: &str = r#"
INSERT INTO bus_offsets (group_id, topic, last_id) VALUES (?, ?, ?)
ON DUPLICATE KEY UPDATE last_id = VALUES(last_id)
"#;

/// SQL bus settings.
#[derive(Debug, Clone)]
pub struct SqlBusConfig {
    pub group_id: String,
    pub offset_reset: OffsetReset,
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl SqlBusConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            offset_reset: OffsetReset::default(),
            poll_interval: Duration::from_millis(DEFAULT_BUS_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BUS_BATCH_SIZE,
        }
    }

    pub fn offset_reset(mut self, reset: OffsetReset) -> Self {
        self.offset_reset = reset;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

#[derive(Default)]
struct ConsumerState {
    /// topic → highest id handed out.
    positions: HashMap<String, i64>,
    /// topic → highest id persisted in `bus_offsets`.
    committed: HashMap<String, i64>,
    pending: VecDeque<(String, EventEnvelope)>,
}

/// Outbox-table bus for one consumer group.
pub struct SqlBus {
    pool: AnyPool,
    db_type: DatabaseType,
    config: SqlBusConfig,
    state: Mutex<ConsumerState>,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl SqlBus {
    pub fn new(pool: AnyPool, db_type: DatabaseType, config: SqlBusConfig) -> Self {
        Self {
            pool,
            db_type,
            config,
            state: Mutex::new(ConsumerState::default()),
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Create the outbox and offset tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), BusError> {
        let outbox = match self.db_type {
            DatabaseType::PostgreSQL => OUTBOX_PG,
            DatabaseType::MySQL => OUTBOX_MYSQL,
            DatabaseType::SQLite => OUTBOX_SQLITE,
        };
        sqlx::query(outbox).execute(&self.pool).await?;
        sqlx::query(OFFSETS_DDL).execute(&self.pool).await?;
        Ok(())
    }

    async fn starting_offset(&self, topic: &str) -> Result<i64, BusError> {
        let committed = sqlx::query(self.db_type.pick(LOAD_OFFSET_PG, LOAD_OFFSET_OTHER))
            .bind(&self.config.group_id)
            .bind(topic)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = committed {
            return Ok(row.try_get("last_id")?);
        }

        match self.config.offset_reset {
            OffsetReset::Earliest => Ok(0),
            OffsetReset::Latest => {
                let row = sqlx::query(self.db_type.pick(TAIL_PG, TAIL_OTHER))
                    .bind(topic)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(row.try_get("last_id")?)
            }
        }
    }

    fn parse_row(row: &AnyRow) -> Result<EventEnvelope, BusError> {
        // SQLite stores booleans as integers.
        let published = row
            .try_get::<bool, _>("published")
            .or_else(|_| row.try_get::<i64, _>("published").map(|v| v != 0))
            .unwrap_or(true);

        Ok(EventEnvelope {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            published,
            event_type: row.try_get("event_type")?,
        })
    }

    /// Pull the next batch of every subscribed topic into `state.pending`.
    async fn fetch(&self, state: &mut ConsumerState) -> Result<(), BusError> {
        let query = self.db_type.pick(FETCH_PG, FETCH_OTHER);
        let mut topics: Vec<(String, i64)> = state
            .positions
            .iter()
            .map(|(t, id)| (t.clone(), *id))
            .collect();
        topics.sort();

        for (topic, after) in topics {
            let rows = sqlx::query(query)
                .bind(&topic)
                .bind(after)
                .bind(self.config.batch_size)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                state.pending.push_back((topic.clone(), Self::parse_row(row)?));
            }
        }
        Ok(())
    }

    /// Persist every position that moved since the last commit.
    async fn commit(&self, state: &mut ConsumerState) -> Result<(), BusError> {
        let query = match self.db_type {
            DatabaseType::PostgreSQL => COMMIT_PG,
            DatabaseType::SQLite => COMMIT_SQLITE,
            DatabaseType::MySQL => COMMIT_MYSQL,
        };

        let dirty: Vec<(String, i64)> = state
            .positions
            .iter()
            .filter(|(topic, id)| state.committed.get(*topic) != Some(*id))
            .map(|(topic, id)| (topic.clone(), *id))
            .collect();

        for (topic, last_id) in dirty {
            sqlx::query(query)
                .bind(&self.config.group_id)
                .bind(&topic)
                .bind(last_id)
                .execute(&self.pool)
                .await?;
            trace!(group = %self.config.group_id, %topic, last_id, "offset committed");
            state.committed.insert(topic, last_id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for SqlBus {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut state = self.state.lock().await;
        for topic in topics {
            if state.positions.contains_key(topic) {
                continue;
            }
            let start = self.starting_offset(topic).await?;
            debug!(group = %self.config.group_id, %topic, start, "subscribed");
            state.positions.insert(topic.clone(), start);
            state.committed.insert(topic.clone(), start);
        }
        self.subscribed.store(true, Ordering::Release);
        Ok(())
    }

    async fn consume(&self) -> Result<EventEnvelope, BusError> {
        if !self.subscribed.load(Ordering::Acquire) {
            return Err(BusError::NotSubscribed);
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }

            {
                let mut state = self.state.lock().await;
                if let Some((topic, envelope)) = state.pending.pop_front() {
                    state.positions.insert(topic, envelope.id);
                    return Ok(envelope);
                }

                // Everything handed out so far has been processed by now.
                self.commit(&mut state).await?;
                self.fetch(&mut state).await?;
                if let Some((topic, envelope)) = state.pending.pop_front() {
                    state.positions.insert(topic, envelope.id);
                    return Ok(envelope);
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn produce(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        sqlx::query(self.db_type.pick(INSERT_PG, INSERT_OTHER))
            .bind(topic)
            .bind(&envelope.event_type)
            .bind(&envelope.payload)
            .bind(true)
            .bind(now_unix_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        // Undelivered rows are fetched again by the next consumer of this group.
        state.pending.clear();
        self.commit(&mut state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UserConsumedTraffic;
    use crate::traits::MessageBusExt;
    use time::OffsetDateTime;

    async fn pool() -> (AnyPool, DatabaseType) {
        tollgate_cache::db::connect("sqlite::memory:", 1, Duration::from_secs(5))
            .await
            .expect("connect")
    }

    async fn bus(pool: &AnyPool, group: &str, reset: OffsetReset) -> SqlBus {
        let bus = SqlBus::new(
            pool.clone(),
            DatabaseType::SQLite,
            SqlBusConfig::new(group)
                .offset_reset(reset)
                .poll_interval(Duration::from_millis(10))
                .batch_size(2),
        );
        bus.ensure_schema().await.expect("schema");
        bus
    }

    fn traffic(user_id: i64) -> UserConsumedTraffic {
        UserConsumedTraffic {
            user_id,
            timestamp: OffsetDateTime::now_utc(),
            in_bytes: 10,
            out_bytes: 20,
        }
    }

    fn topics() -> Vec<String> {
        vec!["PROXY".to_string()]
    }

    #[tokio::test]
    async fn produce_then_consume_in_order() {
        let (pool, _) = pool().await;
        let bus = bus(&pool, "plan-controller", OffsetReset::Earliest).await;
        for id in 1..=3 {
            bus.produce_event("PROXY", &traffic(id)).await.unwrap();
        }

        bus.subscribe(&topics()).await.unwrap();
        for id in 1..=3 {
            let env = bus.consume().await.unwrap();
            assert_eq!(env.event_type, "UserConsumedTraffic");
            assert!(env.published);
            assert_eq!(env.decode::<UserConsumedTraffic>().unwrap().user_id, id);
        }
    }

    #[tokio::test]
    async fn latest_skips_backlog() {
        let (pool, _) = pool().await;
        let producer = bus(&pool, "producer", OffsetReset::Earliest).await;
        producer.produce_event("PROXY", &traffic(1)).await.unwrap();

        let consumer = bus(&pool, "late", OffsetReset::Latest).await;
        consumer.subscribe(&topics()).await.unwrap();
        producer.produce_event("PROXY", &traffic(2)).await.unwrap();

        let env = consumer.consume().await.unwrap();
        assert_eq!(env.decode::<UserConsumedTraffic>().unwrap().user_id, 2);
    }

    #[tokio::test]
    async fn committed_offset_resumes_after_close() {
        let (pool, _) = pool().await;
        let first = bus(&pool, "g", OffsetReset::Earliest).await;
        for id in 1..=3 {
            first.produce_event("PROXY", &traffic(id)).await.unwrap();
        }

        first.subscribe(&topics()).await.unwrap();
        assert_eq!(first.consume().await.unwrap().id, 1);
        assert_eq!(first.consume().await.unwrap().id, 2);
        first.close().await.unwrap();
        first.close().await.unwrap();
        assert!(matches!(first.consume().await, Err(BusError::Closed)));

        let second = bus(&pool, "g", OffsetReset::Earliest).await;
        second.subscribe(&topics()).await.unwrap();
        assert_eq!(second.consume().await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn groups_track_offsets_independently() {
        let (pool, _) = pool().await;
        let a = bus(&pool, "a", OffsetReset::Earliest).await;
        let b = bus(&pool, "b", OffsetReset::Earliest).await;
        a.produce_event("PROXY", &traffic(5)).await.unwrap();

        a.subscribe(&topics()).await.unwrap();
        b.subscribe(&topics()).await.unwrap();
        assert_eq!(a.consume().await.unwrap().id, 1);
        assert_eq!(b.consume().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn consume_waits_for_new_rows() {
        let (pool, _) = pool().await;
        let consumer = std::sync::Arc::new(bus(&pool, "waiter", OffsetReset::Earliest).await);
        consumer.subscribe(&topics()).await.unwrap();

        let c = consumer.clone();
        let waiter = tokio::spawn(async move { c.consume().await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let producer = bus(&pool, "producer", OffsetReset::Earliest).await;
        producer.produce_event("PROXY", &traffic(9)).await.unwrap();

        let env = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("delivered")
            .unwrap()
            .unwrap();
        assert_eq!(env.decode::<UserConsumedTraffic>().unwrap().user_id, 9);
    }

    #[tokio::test]
    async fn consume_requires_subscribe() {
        let (pool, _) = pool().await;
        let bus = bus(&pool, "g", OffsetReset::Earliest).await;
        assert!(matches!(bus.consume().await, Err(BusError::NotSubscribed)));
    }
}
