//! Traffic reports flowing through the controller processors.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tollgate_auth::{MemoryUserStore, RestrictionService, User};
use tollgate_bus::{MemoryBroker, MessageBusExt, PlanAssigned, UserConsumedTraffic};
use tollgate_cache::MemoryCache;
use tollgate_controller::{Controller, MemoryPlanStore, Plan, PlanCaches, PlanStore};

async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn exceeding_restricts_until_new_plan() {
    let broker = MemoryBroker::new();
    let users = Arc::new(MemoryUserStore::from_users([User::new(
        7,
        "alice",
        "alice@example.com",
        "x",
    )]));
    let plans = Arc::new(MemoryPlanStore::with_plans([
        Plan {
            id: 1,
            name: "trial".into(),
            bandwidth_limit_bytes: 1_000,
            duration: Duration::from_secs(3600),
        },
        Plan {
            id: 2,
            name: "unlimited".into(),
            bandwidth_limit_bytes: 0,
            duration: Duration::from_secs(3600),
        },
    ]));
    plans
        .assign_plan(7, 1, OffsetDateTime::now_utc())
        .await
        .unwrap();
    let restrictions = RestrictionService::new(Arc::new(MemoryCache::<bool>::new(None)));
    let controller = Controller::new(users, plans, PlanCaches::memory(), restrictions.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    for processor in [
        controller.traffic_processor(
            Arc::new(broker.bus()),
            "PROXY",
            Arc::new(broker.bus()),
            "PLAN",
        ),
        controller.restriction_processor(Arc::new(broker.bus()), "PLAN"),
        controller.billing_processor(Arc::new(broker.bus()), "BILLING"),
    ] {
        tasks.push(processor.start(shutdown.clone()).await.unwrap());
    }

    let producer = broker.bus();
    for _ in 0..3 {
        producer
            .produce_event(
                "PROXY",
                &UserConsumedTraffic {
                    user_id: 7,
                    timestamp: OffsetDateTime::now_utc(),
                    in_bytes: 300,
                    out_bytes: 100,
                },
            )
            .await
            .unwrap();
    }
    wait_until(|| {
        let r = restrictions.clone();
        async move { r.is_restricted("alice").await }
    })
    .await;

    producer
        .produce_event(
            "BILLING",
            &PlanAssigned {
                user_email: "alice@example.com".into(),
                plan_id: 2,
                timestamp: OffsetDateTime::now_utc(),
            },
        )
        .await
        .unwrap();
    wait_until(|| {
        let r = restrictions.clone();
        async move { !r.is_restricted("alice").await }
    })
    .await;

    shutdown.cancel();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
