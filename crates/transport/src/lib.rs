//! `taskforge-transport`: the broker capability task engines are written against.
//!
//! Adapters for real brokers live in `taskforge-infra`; this crate carries the
//! contract and an in-memory broker for tests/dev.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{Consumer, Delivery, Headers, Message, Position, Transport, TransportError};
pub use in_memory_bus::{InMemoryBroker, InMemoryTransport};
