//! Redis Streams transport (durable, at-least-once delivery).
//!
//! - **Stream key**: `{key_prefix}:{topic}`, one stream per topic
//! - **Fields**: `key`, `payload` (raw bytes), `headers` (JSON object)
//! - **Groups**: created on subscribe with `XGROUP CREATE .. 0 MKSTREAM`
//! - **Pending recovery**: a consumer first re-reads its own unacknowledged
//!   entries (`XREADGROUP .. 0`), then switches to new ones (`>`)
//! - **Undecodable entries** are copied to `{topic}.dlq` with the decode
//!   error, then acknowledged
//!
//! Each consumer owns a dedicated connection, so a blocking `XREADGROUP`
//! never stalls publishes on the shared one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use taskforge_core::headers;
use taskforge_transport::{Consumer, Delivery, Headers, Message, Position, Transport, TransportError};

use crate::client::rfc3339;

/// Default prefix for stream keys.
const DEFAULT_KEY_PREFIX: &str = "taskforge";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL (e.g. `redis://localhost:6379`).
    pub url: String,
    pub key_prefix: String,
    /// Consumer name within each group. Must be stable across restarts for
    /// pending entries to be recovered by the same worker.
    pub consumer_name: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }
}

struct Shared {
    client: redis::Client,
    config: RedisConfig,
    conn: RwLock<Option<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        self.ensure_open()?;
        self.conn
            .read()
            .await
            .clone()
            .ok_or(TransportError::Closed)
    }
}

/// Cheap to clone; clones share one connection and one closed flag.
#[derive(Clone)]
pub struct RedisStreamsTransport {
    shared: Arc<Shared>,
}

impl RedisStreamsTransport {
    pub async fn connect(config: RedisConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        info!(prefix = %config.key_prefix, consumer = %config.consumer_name, "redis transport connected");

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                config,
                conn: RwLock::new(Some(conn)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.shared.config
    }
}

#[async_trait]
impl Transport for RedisStreamsTransport {
    #[instrument(skip(self, message), fields(topic = %topic, key = %message.key), err)]
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        let mut conn = self.shared.connection().await?;
        xadd(&mut conn, &self.shared.config.stream_key(topic), &message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        self.shared.ensure_open()?;
        let stream_key = self.shared.config.stream_key(topic);

        let mut conn = self
            .shared
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => debug!(stream = %stream_key, group = %group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(TransportError::Command(format!("XGROUP CREATE failed: {e}"))),
        }

        Ok(Box::new(RedisStreamsConsumer {
            shared: self.shared.clone(),
            conn,
            topic: topic.to_string(),
            stream_key,
            group: group.to_string(),
            pending_cursor: Some("0".to_string()),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.conn.write().await.take();
            info!("redis transport closed");
        }
        Ok(())
    }
}

async fn xadd(
    conn: &mut MultiplexedConnection,
    stream_key: &str,
    message: &Message,
) -> Result<(), TransportError> {
    let headers = serde_json::to_string(&message.headers)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;

    let _: String = redis::cmd("XADD")
        .arg(stream_key)
        .arg("*")
        .arg("key")
        .arg(&message.key)
        .arg("payload")
        .arg(&message.payload[..])
        .arg("headers")
        .arg(&headers)
        .query_async(conn)
        .await
        .map_err(|e| TransportError::Command(format!("XADD failed: {e}")))?;
    Ok(())
}

fn decode(entry: &StreamId) -> Result<Message, TransportError> {
    let key: String = entry
        .get("key")
        .ok_or_else(|| TransportError::Deserialization(format!("entry {} has no key", entry.id)))?;
    let payload: Vec<u8> = entry.get("payload").unwrap_or_default();
    let headers = match entry.get::<String>("headers") {
        Some(raw) => serde_json::from_str::<Headers>(&raw)
            .map_err(|e| TransportError::Deserialization(e.to_string()))?,
        None => Headers::new(),
    };
    Ok(Message {
        key,
        payload,
        headers,
    })
}

/// Dead-letter record for an entry that could not be decoded. Whatever fields
/// the entry has are carried over as they are.
fn undecodable_record(topic: &str, entry: &StreamId, error: &TransportError) -> Message {
    let mut message = Message::new(
        entry.get::<String>("key").unwrap_or_default(),
        entry.get::<Vec<u8>>("payload").unwrap_or_default(),
    )
    .with_header(headers::ERROR, format!("undecodable entry: {error}"))
    .with_header(headers::ORIGINAL_OFFSET, entry.id.clone())
    .with_header(headers::ORIGINAL_TOPIC, topic)
    .with_header(headers::DLQ_TIMESTAMP, rfc3339(Utc::now()));
    if let Some(raw) = entry.get::<String>("headers") {
        message.set_header(headers::RAW_HEADERS, raw);
    }
    message
}

struct RedisStreamsConsumer {
    shared: Arc<Shared>,
    conn: MultiplexedConnection,
    topic: String,
    stream_key: String,
    group: String,
    /// Where to resume reading our own pending entries; `None` once drained.
    pending_cursor: Option<String>,
}

impl RedisStreamsConsumer {
    async fn read(
        &mut self,
        from: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamId>, TransportError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.shared.config.consumer_name)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            // BLOCK 0 would wait forever.
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(from);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| TransportError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next()))
    }

    async fn xack(&mut self, id: &str) -> Result<(), TransportError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| TransportError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn dead_letter(&mut self, entry: &StreamId, error: &TransportError) -> Result<(), TransportError> {
        let dlq = self.shared.config.stream_key(&format!("{}.dlq", self.topic));
        warn!(id = %entry.id, stream = %dlq, error = %error, "dead-lettering undecodable entry");
        let record = undecodable_record(&self.topic, entry, error);
        xadd(&mut self.conn, &dlq, &record).await?;
        self.xack(&entry.id).await
    }

    fn delivery(&self, entry: &StreamId, message: Message, delivery_count: u32) -> Delivery {
        Delivery {
            position: Position::new(self.topic.clone(), 0, entry.id.clone()),
            message,
            delivery_count,
        }
    }
}

#[async_trait]
impl Consumer for RedisStreamsConsumer {
    async fn recv(&mut self, block: Duration) -> Result<Option<Delivery>, TransportError> {
        self.shared.ensure_open()?;

        while let Some(cursor) = self.pending_cursor.clone() {
            let Some(entry) = self.read(&cursor, None).await? else {
                self.pending_cursor = None;
                break;
            };
            self.pending_cursor = Some(entry.id.clone());

            // Trimmed entries come back with no fields; nothing to redeliver.
            if entry.map.is_empty() {
                self.xack(&entry.id).await?;
                continue;
            }
            match decode(&entry) {
                // Handed out at least once before this process started.
                Ok(message) => return Ok(Some(self.delivery(&entry, message, 2))),
                Err(err) => self.dead_letter(&entry, &err).await?,
            }
        }

        let Some(entry) = self.read(">", Some(block)).await? else {
            return Ok(None);
        };
        match decode(&entry) {
            Ok(message) => Ok(Some(self.delivery(&entry, message, 1))),
            Err(err) => {
                self.dead_letter(&entry, &err).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        self.xack(&delivery.position.offset).await
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        if requeue {
            // Streams have no NACK: append a fresh copy, then retire the original.
            xadd(&mut self.conn, &self.stream_key, &delivery.message).await?;
        }
        self.xack(&delivery.position.offset).await
    }
}
