//! Typed event bus for tollgate.
//!
//! Processes exchange events on topics named after bounded contexts
//! (`PROXY`, `PLAN`, `BILLING`, `USERS`). Every event travels in an
//! [`EventEnvelope`] whose `EventType` tag selects the payload schema.
//!
//! Transports:
//!
//! - [`MemoryBus`]: in-process fan-out through a shared [`MemoryBroker`]
//! - [`SqlBus`]: durable outbox table with per-group offsets
//!
//! An [`EventProcessor`] subscribes a bus and dispatches each event to the
//! handler registered for its type.

mod context;
mod error;
mod events;
mod memory;
mod processor;
mod sql;
mod traits;

pub use context::{BoundedContext, OffsetReset};
pub use error::BusError;
pub use events::{
    Event, EventEnvelope, PlanAssigned, UserConsumedTraffic, UserConsumedTrafficWithoutPlan,
    UserExceededTrafficLimit, UserPasswordChangedEvent,
};
pub use memory::{MemoryBroker, MemoryBus};
pub use processor::{EventHandler, EventProcessor, EventProcessorBuilder, Handles, ProcessorStats};
pub use sql::{SqlBus, SqlBusConfig};
pub use traits::{MessageBus, MessageBusExt};
