//! Applying plan assignments from billing.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tollgate_auth::{RestrictionService, UserStore};
use tollgate_bus::{BusError, Handles, PlanAssigned};
use tollgate_metrics::record_controller_event;
use tracing::info;

use crate::error::ControllerError;
use crate::plan::{PlanStore, UserPlan};
use crate::traffic::PlanCaches;

/// Handler for `PlanAssigned`.
///
/// Stores the new plan, drops the user's cached plan, traffic total and exceed
/// marker so the next report starts a fresh window, and lifts any restriction.
pub struct PlanAssigner {
    users: Arc<dyn UserStore>,
    plans: Arc<dyn PlanStore>,
    caches: PlanCaches,
    restrictions: RestrictionService,
}

impl PlanAssigner {
    pub fn new(
        users: Arc<dyn UserStore>,
        plans: Arc<dyn PlanStore>,
        caches: PlanCaches,
        restrictions: RestrictionService,
    ) -> Self {
        Self {
            users,
            plans,
            caches,
            restrictions,
        }
    }

    pub async fn assign(&self, event: &PlanAssigned) -> Result<UserPlan, ControllerError> {
        let user = self
            .users
            .find_by_email(&event.user_email)
            .await?
            .ok_or_else(|| ControllerError::UnknownUser(event.user_email.clone()))?;
        let user_id = user.id.get();

        let plan = self
            .plans
            .assign_plan(user_id, event.plan_id, OffsetDateTime::now_utc())
            .await?;
        self.caches.invalidate(user_id).await?;
        self.restrictions
            .remove_from_restriction_list(&user.username)
            .await?;

        info!(
            user_id,
            plan_id = plan.plan_id,
            valid_until = %plan.valid_until,
            "plan assigned"
        );
        Ok(plan)
    }
}

#[async_trait]
impl Handles<PlanAssigned> for PlanAssigner {
    async fn on_event(&self, event: PlanAssigned) -> Result<(), BusError> {
        self.assign(&event).await?;
        record_controller_event("PlanAssigned");
        Ok(())
    }
}
