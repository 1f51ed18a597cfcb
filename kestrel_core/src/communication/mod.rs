//! # Kestrel event communication
//!
//! Many-to-many publish/subscribe between modules over string-named events.
//! Payloads are reference counted ([`Payload`](crate::core::Payload)) and
//! delivered asynchronously from a single dispatch thread.

pub mod event_bus;

pub use event_bus::{BusMetrics, EventBus};
