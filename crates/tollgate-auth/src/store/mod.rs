//! User lookup backends.
//!
//! - [`MemoryUserStore`]: fixed set of users, for tests and standalone mode
//! - [`SqlUserStore`]: `users` table through a sqlx `Any` pool
//! - [`CachedUserStore`]: TTL cache in front of any other store

mod cached;
mod memory;
mod sql;
mod traits;

pub use cached::CachedUserStore;
pub use memory::MemoryUserStore;
pub use sql::SqlUserStore;
pub use traits::UserStore;
