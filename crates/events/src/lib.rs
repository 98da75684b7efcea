//! Event contracts shared by every entity actor.
//!
//! Events are the durable record of what happened to a stock ledger or a
//! transfer; the bus fans committed events out to subscribers (reorder
//! alerting, reporting) after they are persisted.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
