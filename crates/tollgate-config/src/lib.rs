//! Configuration loading, environment overlay and validation.
//!
//! Precedence, lowest first: built-in defaults, config file, environment,
//! command line.

mod cli;
mod defaults;
mod env;
mod loader;
mod rate_limit;
mod types;
mod validate;

pub use cli::{CliOverrides, apply_overrides};
pub use env::apply_env;
pub use loader::{ConfigError, load_config};
pub use rate_limit::RateLimitSettings;
pub use types::*;
pub use validate::validate_config;
