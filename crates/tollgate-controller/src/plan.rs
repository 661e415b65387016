//! Plans and the store of per-user plan assignments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ControllerError;

/// A purchasable plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    /// Traffic allowance over the plan's lifetime; 0 = unlimited.
    pub bandwidth_limit_bytes: u64,
    /// Lifetime of one assignment.
    pub duration: Duration,
}

/// A user's active plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPlan {
    pub plan_id: i64,
    pub bandwidth_limit_bytes: u64,
    pub valid_until: OffsetDateTime,
}

impl UserPlan {
    /// Time left at `now`; zero once lapsed.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(self.valid_until - now).unwrap_or(Duration::ZERO)
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.valid_until > now
    }
}

/// Source of plan assignments.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// The plan `user_id` holds at `now`, if any.
    async fn active_plan(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<UserPlan>, ControllerError>;

    /// Give `user_id` plan `plan_id` starting at `now`, replacing any current plan.
    async fn assign_plan(
        &self,
        user_id: i64,
        plan_id: i64,
        now: OffsetDateTime,
    ) -> Result<UserPlan, ControllerError>;
}

#[async_trait]
impl<S: PlanStore + ?Sized> PlanStore for Arc<S> {
    async fn active_plan(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<UserPlan>, ControllerError> {
        (**self).active_plan(user_id, now).await
    }

    async fn assign_plan(
        &self,
        user_id: i64,
        plan_id: i64,
        now: OffsetDateTime,
    ) -> Result<UserPlan, ControllerError> {
        (**self).assign_plan(user_id, plan_id, now).await
    }
}

/// In-process plan store for standalone mode and tests.
#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<i64, Plan>>,
    assignments: RwLock<HashMap<i64, UserPlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans<I: IntoIterator<Item = Plan>>(plans: I) -> Self {
        let store = Self::new();
        for plan in plans {
            store.add_plan(plan);
        }
        store
    }

    pub fn add_plan(&self, plan: Plan) {
        self.plans.write().insert(plan.id, plan);
    }

    /// Set an assignment directly.
    pub fn set_assignment(&self, user_id: i64, plan: UserPlan) {
        self.assignments.write().insert(user_id, plan);
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn active_plan(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<UserPlan>, ControllerError> {
        Ok(self
            .assignments
            .read()
            .get(&user_id)
            .filter(|plan| plan.is_active(now))
            .cloned())
    }

    async fn assign_plan(
        &self,
        user_id: i64,
        plan_id: i64,
        now: OffsetDateTime,
    ) -> Result<UserPlan, ControllerError> {
        let plan = self
            .plans
            .read()
            .get(&plan_id)
            .cloned()
            .ok_or(ControllerError::UnknownPlan(plan_id))?;
        let assigned = UserPlan {
            plan_id,
            bandwidth_limit_bytes: plan.bandwidth_limit_bytes,
            valid_until: now + plan.duration,
        };
        self.assignments.write().insert(user_id, assigned.clone());
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn monthly() -> Plan {
        Plan {
            id: 1,
            name: "monthly".into(),
            bandwidth_limit_bytes: 10_000,
            duration: Duration::from_secs(30 * 24 * 3600),
        }
    }

    #[tokio::test]
    async fn assignment_expires_with_plan_duration() {
        let store = MemoryPlanStore::with_plans([monthly()]);
        let now = datetime!(2024-01-01 0:00 UTC);

        assert_eq!(store.active_plan(7, now).await.unwrap(), None);
        let assigned = store.assign_plan(7, 1, now).await.unwrap();
        assert_eq!(assigned.valid_until, datetime!(2024-01-31 0:00 UTC));
        assert_eq!(store.active_plan(7, now).await.unwrap(), Some(assigned));
        assert_eq!(
            store
                .active_plan(7, datetime!(2024-02-01 0:00 UTC))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected() {
        let store = MemoryPlanStore::new();
        let err = store
            .assign_plan(7, 99, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownPlan(99)));
    }

    #[test]
    fn remaining_saturates() {
        let plan = UserPlan {
            plan_id: 1,
            bandwidth_limit_bytes: 0,
            valid_until: datetime!(2024-01-01 0:00 UTC),
        };
        assert_eq!(plan.remaining(datetime!(2024-01-02 0:00 UTC)), Duration::ZERO);
        assert_eq!(
            plan.remaining(datetime!(2023-12-31 23:00 UTC)),
            Duration::from_secs(3600)
        );
    }
}
