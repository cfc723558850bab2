//! Transport capability (mechanics only).
//!
//! The retry, dead-letter and promotion engines are written once against this
//! small contract; each broker gets a thin adapter.
//!
//! ## Delivery Model
//!
//! - **Topics** are append-only logs of [`Message`]s.
//! - **Consumer groups**: every group sees every message on a topic once;
//!   consumers sharing a group split the messages between them.
//! - **At-least-once**: a delivery stays pending until acknowledged. Adapters
//!   that can recover pending entries redeliver them after a restart.
//! - **No delayed delivery**: messages are visible as soon as they are
//!   published. Delays are implemented above this layer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// String headers attached to a message.
pub type Headers = BTreeMap<String, String>;

/// A message as published: routing key, opaque body, headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Routing/partition key. The task name for task messages.
    pub key: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Where a delivered message lives in the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub topic: String,
    pub partition: u32,
    /// Broker-specific offset (log index, stream entry ID, ...).
    pub offset: String,
}

impl Position {
    pub fn new(topic: impl Into<String>, partition: u32, offset: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: offset.into(),
        }
    }
}

/// Composite key form: `topic:partition:offset`.
impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// A message handed to a consumer, plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub position: Position,
    pub message: Message,
    /// How many times this entry has been handed out (1 on first delivery).
    pub delivery_count: u32,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Internal lock poisoning (in-process transports only).
    #[error("transport state poisoned")]
    Poisoned,
}

/// Publish side plus consumer factory.
///
/// `close` releases connections. Consumers created from a closed transport
/// fail with [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Append a message to `topic`.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    /// Join consumer group `group` on `topic`, creating it when missing.
    async fn subscribe(&self, topic: &str, group: &str)
        -> Result<Box<dyn Consumer>, TransportError>;

    /// Release underlying connections. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One member of a consumer group.
#[async_trait]
pub trait Consumer: Send {
    /// Wait at most `block` for the next delivery. `Ok(None)` means nothing
    /// arrived in time.
    async fn recv(&mut self, block: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Mark a delivery as processed.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Give a delivery back without processing it. With `requeue` the message
    /// becomes available to the group again; without, it is dropped.
    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        (**self).publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        (**self).subscribe(topic, group).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_renders_composite_key() {
        let pos = Position::new("tasks", 0, "1700000000000-3");
        assert_eq!(pos.to_string(), "tasks:0:1700000000000-3");
    }

    #[test]
    fn headers_are_set_and_read() {
        let mut msg = Message::new("send_email", b"{}".to_vec()).with_header("a", "1");
        msg.set_header("b", "2");
        assert_eq!(msg.header("a"), Some("1"));
        assert_eq!(msg.header("b"), Some("2"));
        assert_eq!(msg.header("c"), None);
    }
}
