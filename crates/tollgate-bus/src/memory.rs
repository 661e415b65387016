//! In-process bus.
//!
//! A [`MemoryBroker`] fans each produced event out to every [`MemoryBus`]
//! subscribed to its topic. Every bus is its own consumer, so two processors
//! on separate buses both observe an event. Nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::BusError;
use crate::events::EventEnvelope;
use crate::traits::MessageBus;

struct Subscriber {
    consumer: u64,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

#[derive(Default)]
struct BrokerInner {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicI64,
    next_consumer: AtomicU64,
}

/// Shared routing table. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new consumer/producer handle on this broker.
    pub fn bus(&self) -> MemoryBus {
        let consumer = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryBus {
            broker: self.clone(),
            consumer,
            tx,
            rx: Mutex::new(rx),
            subscribed: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |subs| subs.len())
    }

    fn publish(&self, topic: &str, mut envelope: EventEnvelope) {
        envelope.id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        envelope.published = true;

        let topics = self.inner.topics.read();
        let Some(subs) = topics.get(topic) else {
            trace!(topic, event_type = %envelope.event_type, "no subscribers, event dropped");
            return;
        };
        for sub in subs {
            // A closed receiver is unsubscribed by its own close().
            let _ = sub.tx.send(envelope.clone());
        }
    }

    fn register(&self, topic: &str, consumer: u64, tx: &mpsc::UnboundedSender<EventEnvelope>) {
        let mut topics = self.inner.topics.write();
        let subs = topics.entry(topic.to_owned()).or_default();
        if !subs.iter().any(|s| s.consumer == consumer) {
            subs.push(Subscriber {
                consumer,
                tx: tx.clone(),
            });
        }
    }

    fn unregister(&self, consumer: u64) {
        let mut topics = self.inner.topics.write();
        for subs in topics.values_mut() {
            subs.retain(|s| s.consumer != consumer);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }
}

/// One consumer on a [`MemoryBroker`]; also usable as a producer.
pub struct MemoryBus {
    broker: MemoryBroker,
    consumer: u64,
    tx: mpsc::UnboundedSender<EventEnvelope>,
    rx: Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,
    subscribed: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        for topic in topics {
            self.broker.register(topic, self.consumer, &self.tx);
        }
        self.subscribed.store(true, Ordering::Release);
        Ok(())
    }

    async fn consume(&self) -> Result<EventEnvelope, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        if !self.subscribed.load(Ordering::Acquire) {
            return Err(BusError::NotSubscribed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(BusError::Closed),
            // Our own sender keeps the channel open, so `None` never happens here.
            next = rx.recv() => next.ok_or(BusError::Closed),
        }
    }

    async fn produce(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.broker.publish(topic, envelope);
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.broker.unregister(self.consumer);
        }
        Ok(())
    }
}
