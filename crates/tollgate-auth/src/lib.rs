//! Authentication and restriction services for tollgate.
//!
//! The proxy authenticates every client with Basic credentials:
//!
//! 1. [`BasicCredentials::from_header_value`] decodes `Proxy-Authorization`
//! 2. a [`UserStore`] resolves the username
//! 3. [`AuthService`] verifies the password, caching verdicts per username
//! 4. [`RestrictionService`] refuses users flagged by the plan controller
//!
//! [`Authorizer`] runs these steps behind the [`AuthBackend`] trait.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate_auth::{
//!     Argon2Hasher, AuthBackend, AuthService, Authorizer, BasicCredentials, Credentials,
//!     MemoryUserStore, PasswordHasher, RestrictionService, User,
//! };
//! use tollgate_auth::AuthVerdicts;
//! use tollgate_cache::MemoryCache;
//!
//! # async fn example() -> Result<(), tollgate_auth::AuthError> {
//! let hasher = Arc::new(Argon2Hasher::default());
//! let users = MemoryUserStore::from_users([User::new(7, "user", "u@example.com", hasher.hash("pass")?)]);
//! let authorizer = Authorizer::new(
//!     Arc::new(users),
//!     AuthService::new(hasher, Arc::new(MemoryCache::<AuthVerdicts>::new(None)), Duration::from_secs(300)),
//!     RestrictionService::new(Arc::new(MemoryCache::<bool>::new(None))),
//! );
//!
//! let creds = BasicCredentials::from_header_value("Basic dXNlcjpwYXNz")?;
//! let identity = authorizer.authorize(&Credentials::Basic(creds)).await?;
//! assert_eq!(identity.user_id.get(), 7);
//! # Ok(())
//! # }
//! ```

mod authorizer;
mod error;
mod hash;
mod hasher;
mod restriction;
mod service;
mod store;
mod traits;
mod user;

pub use authorizer::Authorizer;
pub use error::AuthError;
pub use hash::{credential_key, sha224_hex};
pub use hasher::{Argon2Hasher, PasswordHasher};
pub use restriction::{RestrictionService, restriction_key};
pub use service::{AuthCacheEntry, AuthService, AuthStats, AuthVerdicts};
pub use store::{CachedUserStore, MemoryUserStore, SqlUserStore, UserStore};
pub use traits::AuthBackend;
pub use user::{AuthorizedUser, BasicCredentials, Credentials, User, UserId, normalize_username};
