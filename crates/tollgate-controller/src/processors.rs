//! Wiring controller handlers onto bus processors.

use std::sync::Arc;

use tollgate_auth::{RestrictionService, UserStore};
use tollgate_bus::{
    EventProcessor, MessageBus, PlanAssigned, UserConsumedTraffic, UserExceededTrafficLimit,
    UserPasswordChangedEvent,
};

use crate::assign::PlanAssigner;
use crate::invalidate::PasswordChangeInvalidator;
use crate::plan::PlanStore;
use crate::restrict::RestrictionWriter;
use crate::traffic::{PlanCaches, TrafficFold};

/// Shared state of the plan controller.
#[derive(Clone)]
pub struct Controller {
    users: Arc<dyn UserStore>,
    plans: Arc<dyn PlanStore>,
    caches: PlanCaches,
    restrictions: RestrictionService,
}

impl Controller {
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

    pub fn caches(&self) -> &PlanCaches {
        &self.caches
    }

    /// Folds `UserConsumedTraffic` read from `topic`; signals are produced on
    /// `signal_topic` through `signals`.
    pub fn traffic_processor(
        &self,
        bus: Arc<dyn MessageBus>,
        topic: &str,
        signals: Arc<dyn MessageBus>,
        signal_topic: &str,
    ) -> EventProcessor {
        let fold = TrafficFold::new(
            self.plans.clone(),
            self.caches.clone(),
            signals,
            signal_topic,
        );
        EventProcessor::builder("traffic-fold", bus)
            .topic(topic)
            .on::<UserConsumedTraffic, _>(fold)
            .build()
    }

    /// Applies `PlanAssigned` read from `topic`.
    pub fn billing_processor(&self, bus: Arc<dyn MessageBus>, topic: &str) -> EventProcessor {
        let assigner = PlanAssigner::new(
            self.users.clone(),
            self.plans.clone(),
            self.caches.clone(),
            self.restrictions.clone(),
        );
        EventProcessor::builder("plan-assigner", bus)
            .topic(topic)
            .on::<PlanAssigned, _>(assigner)
            .build()
    }

    /// Restricts users named by `UserExceededTrafficLimit` read from `topic`.
    pub fn restriction_processor(&self, bus: Arc<dyn MessageBus>, topic: &str) -> EventProcessor {
        let writer = RestrictionWriter::new(self.users.clone(), self.restrictions.clone());
        EventProcessor::builder("restriction-writer", bus)
            .topic(topic)
            .on::<UserExceededTrafficLimit, _>(writer)
            .build()
    }
}

/// Evicts credentials named by `UserPasswordChangedEvent` read from `topic`.
pub fn invalidation_processor(
    name: &str,
    bus: Arc<dyn MessageBus>,
    topic: &str,
    invalidator: PasswordChangeInvalidator,
) -> EventProcessor {
    EventProcessor::builder(name, bus)
        .topic(topic)
        .on::<UserPasswordChangedEvent, _>(invalidator)
        .build()
}
