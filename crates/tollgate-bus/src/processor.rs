//! Background dispatch of consumed events to typed handlers.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::BusError;
use crate::events::{Event, EventEnvelope};
use crate::traits::MessageBus;

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Handles one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), BusError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        (**self).handle(envelope).await
    }
}

/// Handles a decoded `E`.
#[async_trait]
pub trait Handles<E: Event>: Send + Sync {
    async fn on_event(&self, event: E) -> Result<(), BusError>;
}

/// Decodes the envelope before calling a [`Handles<E>`].
struct Typed<E, H> {
    inner: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> EventHandler for Typed<E, H>
where
    E: Event,
    H: Handles<E>,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let event = envelope.decode::<E>()?;
        self.inner.on_event(event).await
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub handled: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

impl ProcessorStats {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Collects topics and `event type → handler` mappings.
pub struct EventProcessorBuilder {
    name: String,
    bus: Arc<dyn MessageBus>,
    topics: Vec<String>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventProcessorBuilder {
    pub fn new(name: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            name: name.into(),
            bus,
            topics: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }

    /// Route events of type `E` to `handler`. A later mapping for the same
    /// type replaces the earlier one.
    pub fn on<E, H>(self, handler: H) -> Self
    where
        E: Event,
        H: Handles<E> + 'static,
    {
        self.handler(
            E::EVENT_TYPE,
            Typed {
                inner: handler,
                _event: PhantomData::<fn() -> E>,
            },
        )
    }

    /// Route raw envelopes tagged `event_type` to `handler`.
    pub fn handler(
        mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> EventProcessor {
        EventProcessor {
            name: self.name,
            bus: self.bus,
            topics: self.topics,
            handlers: self.handlers,
            stats: Arc::new(ProcessorStats::default()),
        }
    }
}

/// Consumes a bus and invokes handlers sequentially.
pub struct EventProcessor {
    name: String,
    bus: Arc<dyn MessageBus>,
    topics: Vec<String>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    stats: Arc<ProcessorStats>,
}

impl EventProcessor {
    pub fn builder(name: impl Into<String>, bus: Arc<dyn MessageBus>) -> EventProcessorBuilder {
        EventProcessorBuilder::new(name, bus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    /// Subscribe and spawn the dispatch loop.
    ///
    /// The loop runs until `shutdown` is cancelled or the bus reports
    /// [`BusError::Closed`]; it closes the bus on the way out.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        self.bus.subscribe(&self.topics).await?;
        info!(
            processor = %self.name,
            topics = ?self.topics,
            handlers = self.handlers.len(),
            "event processor started"
        );
        Ok(tokio::spawn(self.run(shutdown)))
    }

    async fn run(self, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.bus.consume() => next,
            };

            match next {
                Ok(envelope) => self.dispatch(&envelope).await,
                Err(BusError::Closed) => {
                    debug!(processor = %self.name, "bus closed");
                    break;
                }
                Err(e) => {
                    warn!(processor = %self.name, error = %e, "consume failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if let Err(e) = self.bus.close().await {
            warn!(processor = %self.name, error = %e, "bus close failed");
        }
        info!(processor = %self.name, "event processor stopped");
    }

    async fn dispatch(&self, envelope: &EventEnvelope) {
        let Some(handler) = self.handlers.get(&envelope.event_type) else {
            trace!(processor = %self.name, event_type = %envelope.event_type, "no handler");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match handler.handle(envelope).await {
            Ok(()) => {
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    processor = %self.name,
                    event_type = %envelope.event_type,
                    id = envelope.id,
                    error = %e,
                    "handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{UserExceededTrafficLimit, UserPasswordChangedEvent};
    use crate::memory::MemoryBroker;
    use crate::traits::MessageBusExt;
    use parking_lot::Mutex;
    use time::OffsetDateTime;

    #[derive(Default, Clone)]
    struct Recorder {
        names: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handles<UserPasswordChangedEvent> for Recorder {
        async fn on_event(&self, event: UserPasswordChangedEvent) -> Result<(), BusError> {
            if event.username == "boom" {
                return Err(BusError::handler("boom"));
            }
            self.names.lock().push(event.username);
            Ok(())
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn changed(name: &str) -> UserPasswordChangedEvent {
        UserPasswordChangedEvent {
            username: name.into(),
        }
    }

    #[tokio::test]
    async fn dispatches_and_survives_errors() {
        let broker = MemoryBroker::new();
        let recorder = Recorder::default();
        let processor = EventProcessor::builder("test", Arc::new(broker.bus()))
            .topic("USERS")
            .on::<UserPasswordChangedEvent, _>(recorder.clone())
            .build();
        let stats = processor.stats();
        let token = CancellationToken::new();
        let handle = processor.start(token.clone()).await.unwrap();

        let producer = broker.bus();
        producer.produce_event("USERS", &changed("alice")).await.unwrap();
        producer.produce_event("USERS", &changed("boom")).await.unwrap();
        producer
            .produce_event(
                "USERS",
                &UserExceededTrafficLimit {
                    user_id: 1,
                    timestamp: OffsetDateTime::now_utc(),
                },
            )
            .await
            .unwrap();
        producer.produce_event("USERS", &changed("bob")).await.unwrap();

        wait_until(|| stats.handled() == 2).await;
        assert_eq!(*recorder.names.lock(), vec!["alice", "bob"]);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.skipped(), 1);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(broker.subscriber_count("USERS"), 0);
    }

    #[tokio::test]
    async fn exits_when_bus_closed() {
        let broker = MemoryBroker::new();
        let bus = Arc::new(broker.bus());
        let processor = EventProcessor::builder("closing", bus.clone())
            .topic("USERS")
            .build();
        let handle = processor.start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .unwrap();
    }
}
