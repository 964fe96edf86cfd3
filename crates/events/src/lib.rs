//! Booking event envelopes and the bus that fans them out.
//!
//! The booking engine emits a handful of facts (a meeting changed status, a
//! loyalty reward must be cancelled) that other parts of the system react to.
//! The events themselves live next to the code that raises them.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{Event, EventEnvelope};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
