//! Authorization backend trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AuthError;
use crate::user::{AuthorizedUser, Credentials};

/// Turns client credentials into a connection identity.
///
/// Implementations must be thread-safe (`Send + Sync`) as they are called
/// concurrently from every client connection.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// # Returns
    /// * `Ok(AuthorizedUser)` - credentials valid and user not restricted
    /// * `Err(AuthError::Invalid | AuthError::Restricted)` - refuse the client
    /// * `Err(_)` - backend failure
    async fn authorize(&self, credentials: &Credentials) -> Result<AuthorizedUser, AuthError>;
}

#[async_trait]
impl<A: AuthBackend + ?Sized> AuthBackend for Arc<A> {
    #[inline]
    async fn authorize(&self, credentials: &Credentials) -> Result<AuthorizedUser, AuthError> {
        (**self).authorize(credentials).await
    }
}

#[async_trait]
impl<A: AuthBackend + ?Sized> AuthBackend for Box<A> {
    #[inline]
    async fn authorize(&self, credentials: &Credentials) -> Result<AuthorizedUser, AuthError> {
        (**self).authorize(credentials).await
    }
}
