//! Key/value caches with per-key TTL.
//!
//! Two implementations share the [`Cache`] trait:
//!
//! - [`MemoryCache`]: in-process map behind a readers/writer lock, expired lazily on read
//! - [`SqlCache`]: remote table reachable from several processes, values encoded with bincode
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tollgate_cache::{Cache, MemoryCache};
//!
//! # async fn example() -> Result<(), tollgate_cache::CacheError> {
//! let cache: MemoryCache<u64> = MemoryCache::new(None);
//! cache.set("user:7", 42).await?;
//! assert_eq!(cache.get("user:7").await, Some(42));
//!
//! cache.expire("user:7", Duration::ZERO).await?;
//! assert_eq!(cache.get("user:7").await, None);
//! # Ok(())
//! # }
//! ```

pub mod db;
mod error;
mod memory;
mod sql;
mod traits;

pub use db::DatabaseType;
pub use error::CacheError;
pub use memory::{CacheStats, MemoryCache};
pub use sql::SqlCache;
pub use traits::{Cache, Evict};
