//! Data-access trait for user stores.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AuthError;
use crate::user::{User, UserId};

/// Read-only access to registered users.
///
/// Return `Ok(None)` when no user matches; callers decide whether that is
/// an authentication failure or a skipped event.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up by username. Implementations normalise the argument.
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AuthError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;
}

#[async_trait]
impl<S: UserStore + ?Sized> UserStore for Arc<S> {
    #[inline]
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        (**self).find_by_username(username).await
    }

    #[inline]
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AuthError> {
        (**self).find_by_id(id).await
    }

    #[inline]
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        (**self).find_by_email(email).await
    }
}
