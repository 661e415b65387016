//! Folding proxy traffic reports into per-user totals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tollgate_bus::{
    BusError, Event, Handles, MessageBus, MessageBusExt, UserConsumedTraffic,
    UserConsumedTrafficWithoutPlan, UserExceededTrafficLimit,
};
use tollgate_cache::{Cache, MemoryCache};
use tollgate_metrics::{record_controller_event, record_controller_signal_dropped};
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::plan::{PlanStore, UserPlan};

/// Lifetime of the running total of a user without a plan.
pub const NO_PLAN_TTL: Duration = Duration::from_secs(3600);

/// Shortest lifetime given to any written entry.
const MIN_TTL: Duration = Duration::from_secs(1);

pub fn traffic_key(user_id: i64) -> String {
    format!("user:{user_id}:traffic")
}

pub fn plan_key(user_id: i64) -> String {
    format!("user:{user_id}:plan")
}

/// Present while an exceed signal for the current plan window has been sent.
pub fn exceeded_key(user_id: i64) -> String {
    format!("user:{user_id}:restricted")
}

/// Running traffic total of one user within the current plan window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub in_bytes: u64,
    pub out_bytes: u64,
    /// 0 = unlimited.
    pub plan_limit_bytes: u64,
    pub plan_valid_until: Option<OffsetDateTime>,
    pub actualized_at: OffsetDateTime,
}

impl UserTraffic {
    fn fresh(plan: Option<&UserPlan>, now: OffsetDateTime) -> Self {
        Self {
            in_bytes: 0,
            out_bytes: 0,
            plan_limit_bytes: plan.map_or(0, |p| p.bandwidth_limit_bytes),
            plan_valid_until: plan.map(|p| p.valid_until),
            actualized_at: now,
        }
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.in_bytes.saturating_add(self.out_bytes)
    }

    pub fn exceeds_limit(&self) -> bool {
        self.plan_limit_bytes > 0 && self.total() > self.plan_limit_bytes
    }

    /// How long the entry should stay cached at `now`.
    fn ttl(&self, now: OffsetDateTime) -> Duration {
        match self.plan_valid_until {
            Some(until) => Duration::try_from(until - now).unwrap_or(Duration::ZERO),
            None => NO_PLAN_TTL,
        }
        .max(MIN_TTL)
    }
}

/// Caches the controller keeps per user.
#[derive(Clone)]
pub struct PlanCaches {
    pub traffic: Arc<dyn Cache<UserTraffic>>,
    pub plans: Arc<dyn Cache<UserPlan>>,
    pub markers: Arc<dyn Cache<bool>>,
}

impl PlanCaches {
    /// In-process caches.
    pub fn memory() -> Self {
        Self {
            traffic: Arc::new(MemoryCache::<UserTraffic>::new(None)),
            plans: Arc::new(MemoryCache::<UserPlan>::new(None)),
            markers: Arc::new(MemoryCache::<bool>::new(None)),
        }
    }

    /// Forget everything cached for `user_id`.
    pub async fn invalidate(&self, user_id: i64) -> Result<(), ControllerError> {
        self.plans.delete(&plan_key(user_id)).await?;
        self.traffic.delete(&traffic_key(user_id)).await?;
        self.markers.delete(&exceeded_key(user_id)).await?;
        Ok(())
    }
}

/// Handler for `UserConsumedTraffic`.
///
/// Signals go to `signal_topic`: `UserConsumedTrafficWithoutPlan` when a
/// user's total is started without a plan, `UserExceededTrafficLimit` once per
/// plan window when the total crosses the limit. A signal that fails to
/// publish is retried on the user's next report.
pub struct TrafficFold {
    plans: Arc<dyn PlanStore>,
    caches: PlanCaches,
    bus: Arc<dyn MessageBus>,
    signal_topic: String,
}

impl TrafficFold {
    pub fn new(
        plans: Arc<dyn PlanStore>,
        caches: PlanCaches,
        bus: Arc<dyn MessageBus>,
        signal_topic: impl Into<String>,
    ) -> Self {
        Self {
            plans,
            caches,
            bus,
            signal_topic: signal_topic.into(),
        }
    }

    async fn active_plan(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<UserPlan>, ControllerError> {
        let key = plan_key(user_id);
        if let Some(plan) = self.caches.plans.get(&key).await
            && plan.is_active(now)
        {
            return Ok(Some(plan));
        }

        let plan = self.plans.active_plan(user_id, now).await?;
        if let Some(plan) = &plan
            && let Err(e) = self
                .caches
                .plans
                .set_with_ttl(&key, plan.clone(), plan.remaining(now).max(MIN_TTL))
                .await
        {
            debug!(user_id, error = %e, "plan cache write failed");
        }
        Ok(plan)
    }

    async fn start_total(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> Result<UserTraffic, ControllerError> {
        let plan = self.active_plan(user_id, now).await?;
        if plan.is_none() {
            let signal = UserConsumedTrafficWithoutPlan {
                user_id,
                timestamp: now,
            };
            match self.bus.produce_event(&self.signal_topic, &signal).await {
                Ok(()) => debug!(user_id, "traffic without plan"),
                Err(e) => {
                    record_controller_signal_dropped(UserConsumedTrafficWithoutPlan::EVENT_TYPE);
                    warn!(user_id, error = %e, "no-plan signal dropped");
                }
            }
        }
        Ok(UserTraffic::fresh(plan.as_ref(), now))
    }

    /// Fold one report; returns the updated total.
    pub async fn fold(&self, event: UserConsumedTraffic) -> Result<UserTraffic, ControllerError> {
        let now = OffsetDateTime::now_utc();
        let user_id = event.user_id;
        let key = traffic_key(user_id);

        let mut current = match self.caches.traffic.get(&key).await {
            Some(current) => current,
            None => self.start_total(user_id, now).await?,
        };
        current.in_bytes = current.in_bytes.saturating_add(event.in_bytes);
        current.out_bytes = current.out_bytes.saturating_add(event.out_bytes);
        current.actualized_at = now;

        let ttl = current.ttl(now);
        self.caches
            .traffic
            .set_with_ttl(&key, current.clone(), ttl)
            .await?;

        if current.exceeds_limit() {
            let marker = exceeded_key(user_id);
            if self.caches.markers.get(&marker).await.is_none() {
                let signal = UserExceededTrafficLimit {
                    user_id,
                    timestamp: now,
                };
                // The marker stays unset so the next report publishes again.
                if let Err(e) = self.bus.produce_event(&self.signal_topic, &signal).await {
                    record_controller_signal_dropped(UserExceededTrafficLimit::EVENT_TYPE);
                    warn!(
                        user_id,
                        error = %e,
                        "exceed signal not published, retrying on next report"
                    );
                    return Ok(current);
                }
                info!(
                    user_id,
                    total = current.total(),
                    limit = current.plan_limit_bytes,
                    "traffic limit exceeded"
                );
                if let Err(e) = self.caches.markers.set_with_ttl(&marker, true, ttl).await {
                    warn!(user_id, error = %e, "exceed marker write failed");
                }
            }
        }
        Ok(current)
    }
}

#[async_trait]
impl Handles<UserConsumedTraffic> for TrafficFold {
    async fn on_event(&self, event: UserConsumedTraffic) -> Result<(), BusError> {
        self.fold(event).await?;
        record_controller_event("UserConsumedTraffic");
        Ok(())
    }
}
