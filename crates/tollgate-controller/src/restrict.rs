//! Turning exceed signals into restrictions.

use std::sync::Arc;

use async_trait::async_trait;
use tollgate_auth::{RestrictionService, UserId, UserStore};
use tollgate_bus::{BusError, Handles, UserExceededTrafficLimit};
use tollgate_metrics::record_controller_event;
use tracing::info;

use crate::error::ControllerError;

/// Handler for `UserExceededTrafficLimit`: restricts the user until a new
/// plan is assigned.
pub struct RestrictionWriter {
    users: Arc<dyn UserStore>,
    restrictions: RestrictionService,
}

impl RestrictionWriter {
    pub fn new(users: Arc<dyn UserStore>, restrictions: RestrictionService) -> Self {
        Self {
            users,
            restrictions,
        }
    }

    pub async fn restrict(&self, user_id: i64) -> Result<(), ControllerError> {
        let user = self
            .users
            .find_by_id(UserId(user_id))
            .await?
            .ok_or_else(|| ControllerError::UnknownUser(user_id.to_string()))?;
        self.restrictions
            .add_to_restriction_list(&user.username, None)
            .await?;
        info!(user_id, username = %user.username, "user restricted");
        Ok(())
    }
}

#[async_trait]
impl Handles<UserExceededTrafficLimit> for RestrictionWriter {
    async fn on_event(&self, event: UserExceededTrafficLimit) -> Result<(), BusError> {
        self.restrict(event.user_id).await?;
        record_controller_event("UserExceededTrafficLimit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use tollgate_auth::{MemoryUserStore, User};
    use tollgate_cache::MemoryCache;

    fn writer() -> (RestrictionWriter, RestrictionService) {
        let users = MemoryUserStore::from_users([User::new(7, "alice", "alice@example.com", "x")]);
        let restrictions = RestrictionService::new(Arc::new(MemoryCache::<bool>::new(None)));
        (
            RestrictionWriter::new(Arc::new(users), restrictions.clone()),
            restrictions,
        )
    }

    #[tokio::test]
    async fn exceeded_user_is_restricted() {
        let (writer, restrictions) = writer();
        writer
            .on_event(UserExceededTrafficLimit {
                user_id: 7,
                timestamp: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        assert!(restrictions.is_restricted("alice").await);
    }

    #[tokio::test]
    async fn unknown_user_is_an_error() {
        let (writer, restrictions) = writer();
        assert!(matches!(
            writer.restrict(8).await,
            Err(ControllerError::UnknownUser(_))
        ));
        assert!(!restrictions.is_restricted("alice").await);
    }
}
