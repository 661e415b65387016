//! Message bus trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::events::{Event, EventEnvelope};

/// Topic-based publish/subscribe transport.
///
/// `produce` returns once the transport has accepted the event. Ordering is
/// preserved within one topic, not across topics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register interest in `topics`. Must precede [`consume`](Self::consume).
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError>;

    /// Wait for the next event on any subscribed topic.
    ///
    /// Returns [`BusError::Closed`] once the bus has been closed.
    async fn consume(&self) -> Result<EventEnvelope, BusError>;

    /// Publish `envelope` on `topic`.
    async fn produce(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError>;

    /// Commit progress and stop delivering. Idempotent.
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    #[inline]
    async fn subscribe(&self, topics: &[String]) -> Result<(), BusError> {
        (**self).subscribe(topics).await
    }

    #[inline]
    async fn consume(&self) -> Result<EventEnvelope, BusError> {
        (**self).consume().await
    }

    #[inline]
    async fn produce(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        (**self).produce(topic, envelope).await
    }

    #[inline]
    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}

/// Typed produce on top of any [`MessageBus`].
#[async_trait]
pub trait MessageBusExt: MessageBus {
    async fn produce_event<E: Event>(&self, topic: &str, event: &E) -> Result<(), BusError> {
        let envelope = EventEnvelope::from_event(event)?;
        self.produce(topic, envelope).await
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}
