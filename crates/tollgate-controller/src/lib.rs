//! Plan controller for tollgate.
//!
//! Consumes the events around a user's plan and keeps the restriction list
//! the proxies consult in step with it:
//!
//! - [`TrafficFold`] sums `UserConsumedTraffic` per user and signals
//!   `UserExceededTrafficLimit` or `UserConsumedTrafficWithoutPlan`
//! - [`RestrictionWriter`] restricts users whose limit was exceeded
//! - [`PlanAssigner`] stores `PlanAssigned`, resets the window and lifts the restriction
//! - [`PasswordChangeInvalidator`] evicts cached credentials on `UserPasswordChangedEvent`
//!
//! [`Controller`] wires the handlers onto [`EventProcessor`](tollgate_bus::EventProcessor)s.

mod assign;
mod error;
mod invalidate;
mod plan;
mod processors;
mod restrict;
mod sql;
mod traffic;

pub use assign::PlanAssigner;
pub use error::ControllerError;
pub use invalidate::PasswordChangeInvalidator;
pub use plan::{MemoryPlanStore, Plan, PlanStore, UserPlan};
pub use processors::{Controller, invalidation_processor};
pub use restrict::RestrictionWriter;
pub use sql::SqlPlanStore;
pub use traffic::{
    NO_PLAN_TTL, PlanCaches, TrafficFold, UserTraffic, exceeded_key, plan_key, traffic_key,
};
