//! In-memory broker for tests/dev.
//!
//! - One shared log per topic, consumer groups with their own cursor
//! - Pending-entry tracking until ack
//! - Each [`InMemoryTransport`] handle can be closed independently

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Consumer, Delivery, Message, Position, Transport, TransportError};

#[derive(Debug, Default)]
struct GroupCursor {
    /// Next never-delivered log index.
    next: usize,
    /// Rejected-with-requeue entries, served before new ones.
    redeliver: VecDeque<usize>,
    /// Delivered but unacknowledged entries and their delivery counts.
    pending: BTreeMap<usize, u32>,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<Message>,
    groups: HashMap<String, GroupCursor>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, TopicLog>>,
    published: Notify,
}

impl BrokerState {
    fn topics(&self) -> Result<MutexGuard<'_, HashMap<String, TopicLog>>, TransportError> {
        self.topics.lock().map_err(|_| TransportError::Poisoned)
    }
}

/// Shared in-process broker. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new transport handle onto this broker.
    pub fn connect(&self) -> InMemoryTransport {
        InMemoryTransport {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(Notify::new()),
        }
    }

    /// Every message ever published to `topic`, in order.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.state
            .topics()
            .map(|topics| {
                topics
                    .get(topic)
                    .map(|log| log.entries.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Number of delivered-but-unacknowledged entries for a group.
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.state
            .topics()
            .map(|topics| {
                topics
                    .get(topic)
                    .and_then(|log| log.groups.get(group))
                    .map(|cursor| cursor.pending.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Entries not yet handed to `group` (new or requeued).
    pub fn backlog(&self, topic: &str, group: &str) -> usize {
        self.state
            .topics()
            .map(|topics| match topics.get(topic) {
                Some(log) => match log.groups.get(group) {
                    Some(cursor) => {
                        log.entries.len().saturating_sub(cursor.next) + cursor.redeliver.len()
                    }
                    None => log.entries.len(),
                },
                None => 0,
            })
            .unwrap_or(0)
    }
}

/// A handle onto an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    closing: Arc<Notify>,
}

impl InMemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        self.ensure_open()?;
        {
            let mut topics = self.state.topics()?;
            topics
                .entry(topic.to_string())
                .or_default()
                .entries
                .push(message);
        }
        self.state.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        self.ensure_open()?;
        {
            let mut topics = self.state.topics()?;
            topics
                .entry(topic.to_string())
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();
        }

        Ok(Box::new(InMemoryConsumer {
            transport: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closing.notify_waiters();
            debug!("in-memory transport handle closed");
        }
        Ok(())
    }
}

struct InMemoryConsumer {
    transport: InMemoryTransport,
    topic: String,
    group: String,
}

impl InMemoryConsumer {
    fn try_take(&self) -> Result<Option<Delivery>, TransportError> {
        let mut topics = self.transport.state.topics()?;
        let log = topics.entry(self.topic.clone()).or_default();
        let cursor = log.groups.entry(self.group.clone()).or_default();

        let index = match cursor.redeliver.pop_front() {
            Some(index) => index,
            None if cursor.next < log.entries.len() => {
                cursor.next += 1;
                cursor.next - 1
            }
            None => return Ok(None),
        };

        let count = cursor.pending.entry(index).or_insert(0);
        *count += 1;

        Ok(Some(Delivery {
            position: Position::new(self.topic.clone(), 0, index.to_string()),
            message: log.entries[index].clone(),
            delivery_count: *count,
        }))
    }

    fn offset_of(&self, delivery: &Delivery) -> Result<usize, TransportError> {
        delivery.position.offset.parse().map_err(|_| {
            TransportError::Deserialization(format!(
                "not an in-memory offset: {}",
                delivery.position
            ))
        })
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn recv(&mut self, block: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + block;

        loop {
            self.transport.ensure_open()?;

            // Register for wakeups before looking, so a publish in between is not lost.
            let published = self.transport.state.published.notified();
            let closing = self.transport.closing.notified();
            tokio::pin!(published);
            tokio::pin!(closing);
            published.as_mut().enable();
            closing.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut published => continue,
                _ = &mut closing => return Err(TransportError::Closed),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let index = self.offset_of(delivery)?;
        let mut topics = self.transport.state.topics()?;
        if let Some(cursor) = topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group))
        {
            cursor.pending.remove(&index);
        }
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let index = self.offset_of(delivery)?;
        {
            let mut topics = self.transport.state.topics()?;
            let Some(cursor) = topics
                .get_mut(&self.topic)
                .and_then(|log| log.groups.get_mut(&self.group))
            else {
                return Ok(());
            };
            if requeue {
                if cursor.pending.contains_key(&index) {
                    cursor.redeliver.push_back(index);
                    debug!(topic = %self.topic, group = %self.group, offset = index, "entry requeued");
                }
            } else {
                cursor.pending.remove(&index);
            }
        }
        if requeue {
            self.transport.state.published.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn each_group_sees_every_message_once() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect();

        let mut a = transport.subscribe("tasks", "group-a").await.unwrap();
        let mut b = transport.subscribe("tasks", "group-b").await.unwrap();

        transport.publish("tasks", Message::new("t", b"1".to_vec())).await.unwrap();
        transport.publish("tasks", Message::new("t", b"2".to_vec())).await.unwrap();

        for consumer in [&mut a, &mut b] {
            let first = consumer.recv(BLOCK).await.unwrap().unwrap();
            let second = consumer.recv(BLOCK).await.unwrap().unwrap();
            assert_eq!(first.message.payload, b"1");
            assert_eq!(second.message.payload, b"2");
            assert_eq!(first.position.offset, "0");
            assert!(consumer.recv(BLOCK).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn consumers_in_one_group_split_the_work() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect();
        let mut c1 = transport.subscribe("tasks", "workers").await.unwrap();
        let mut c2 = transport.subscribe("tasks", "workers").await.unwrap();

        transport.publish("tasks", Message::new("t", b"x".to_vec())).await.unwrap();

        let got1 = c1.recv(BLOCK).await.unwrap();
        let got2 = c2.recv(BLOCK).await.unwrap();
        assert!(got1.is_some() ^ got2.is_some());
    }

    #[tokio::test]
    async fn pending_until_ack() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect();
        let mut consumer = transport.subscribe("tasks", "g").await.unwrap();
        transport.publish("tasks", Message::new("t", b"x".to_vec())).await.unwrap();

        let delivery = consumer.recv(BLOCK).await.unwrap().unwrap();
        assert_eq!(broker.pending("tasks", "g"), 1);

        consumer.ack(&delivery).await.unwrap();
        assert_eq!(broker.pending("tasks", "g"), 0);
    }

    #[tokio::test]
    async fn requeued_delivery_comes_back_with_higher_count() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect();
        let mut consumer = transport.subscribe("tasks", "g").await.unwrap();
        transport.publish("tasks", Message::new("t", b"x".to_vec())).await.unwrap();

        let first = consumer.recv(BLOCK).await.unwrap().unwrap();
        consumer.reject(&first, true).await.unwrap();

        let again = consumer.recv(BLOCK).await.unwrap().unwrap();
        assert_eq!(again.position, first.position);
        assert_eq!(again.delivery_count, 2);

        consumer.reject(&again, false).await.unwrap();
        assert_eq!(broker.pending("tasks", "g"), 0);
        assert!(consumer.recv(BLOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect();
        let mut consumer = transport.subscribe("tasks", "g").await.unwrap();

        let publisher = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("tasks", Message::new("t", b"late".to_vec()))
                .await
                .unwrap();
        });

        let delivery = consumer.recv(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delivery.message.payload, b"late");
    }

    #[tokio::test]
    async fn closing_one_handle_leaves_others_open() {
        let broker = InMemoryBroker::new();
        let first = broker.connect();
        let second = broker.connect();
        let mut consumer = first.subscribe("tasks", "g").await.unwrap();

        first.close().await.unwrap();
        first.close().await.unwrap();

        assert!(matches!(
            first.publish("tasks", Message::new("t", Vec::new())).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(consumer.recv(BLOCK).await, Err(TransportError::Closed)));

        second.publish("tasks", Message::new("t", Vec::new())).await.unwrap();
        assert_eq!(broker.messages("tasks").len(), 1);
        assert_eq!(broker.backlog("tasks", "g"), 1);
    }
}
