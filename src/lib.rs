//! # tollgate
//!
//! An authenticating HTTP/HTTPS forward proxy. Each user is pinned to a
//! public source address, their traffic is reported on an event bus, and a
//! plan controller restricts users who exceed their plan.
//!
//! ## Crates
//!
//! - [`tollgate_core`] - Defaults, error labels and the counting relay
//! - [`tollgate_cache`] - Memory and SQL key/value caches with TTL
//! - [`tollgate_auth`] - Users, password verification and restrictions
//! - [`tollgate_bus`] - Typed events, memory and SQL transports, processors
//! - [`tollgate_egress`] - Source-address discovery and per-user dialers
//! - [`tollgate_config`] - Configuration loading, environment and validation
//! - [`tollgate_metrics`] - Prometheus metrics
//! - [`tollgate_server`] - The proxy listener and connection pipeline
//! - [`tollgate_controller`] - Plan store, traffic folding and restriction handlers

pub mod app;
pub mod cli;

pub use tollgate_auth as auth;
pub use tollgate_bus as bus;
pub use tollgate_cache as cache;
pub use tollgate_config as config;
pub use tollgate_controller as controller;
pub use tollgate_core as core;
pub use tollgate_egress as egress;
pub use tollgate_metrics as metrics;
pub use tollgate_server as server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tollgate_auth::{AuthBackend, Authorizer, UserStore};
    pub use tollgate_bus::{EventProcessor, MessageBus, MessageBusExt};
    pub use tollgate_config::{Config, Mode, load_config, validate_config};
    pub use tollgate_server::{CancellationToken, ProxyComponents, ProxyServer, ServerError};
}
