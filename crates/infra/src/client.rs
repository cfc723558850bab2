//! Producer side: immediate and delayed enqueue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info};

use taskforge_core::{Clock, PayloadError, SystemClock, TaskPayload, headers, new_correlation_id};
use taskforge_transport::{Message, Transport, TransportError};

use crate::config::QueueTopics;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("task name must not be empty")]
    EmptyTaskName,

    #[error("delay of {0:?} puts the due time out of range")]
    InvalidDelay(Duration),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Anything that can put a task on the queue.
///
/// The scheduler only needs this much of a [`Client`].
#[async_trait]
pub trait TaskEnqueuer: Send + Sync + 'static {
    /// Enqueue for immediate execution; returns the correlation id.
    async fn enqueue(&self, task_name: &str, payload: TaskPayload) -> Result<String, ClientError>;

    /// Release connections held by the enqueuer.
    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

#[async_trait]
impl<E> TaskEnqueuer for Arc<E>
where
    E: TaskEnqueuer + ?Sized,
{
    async fn enqueue(&self, task_name: &str, payload: TaskPayload) -> Result<String, ClientError> {
        (**self).enqueue(task_name, payload).await
    }

    async fn close(&self) -> Result<(), ClientError> {
        (**self).close().await
    }
}

/// Publishes task messages onto a queue.
///
/// Delayed tasks go to the waiting topic with their due time in headers; the
/// promoter moves them to the active topic once due.
pub struct Client<T: Transport> {
    transport: T,
    topics: QueueTopics,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, topics: QueueTopics) -> Self {
        Self {
            transport,
            topics,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn topics(&self) -> &QueueTopics {
        &self.topics
    }

    /// Publish `payload` for immediate execution by a `task_name` handler.
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: TaskPayload,
    ) -> Result<String, ClientError> {
        let correlation_id = new_correlation_id();
        let message = self
            .build(task_name, &payload, &correlation_id)?
            .with_header(headers::ENQUEUED_AT, rfc3339(self.clock.now()));

        self.transport.publish(&self.topics.active, message).await?;
        debug!(task = %task_name, correlation_id = %correlation_id, "task enqueued");
        Ok(correlation_id)
    }

    /// Publish `payload` to run no earlier than `delay` from now.
    ///
    /// A zero delay is an immediate enqueue.
    pub async fn enqueue_delayed(
        &self,
        task_name: &str,
        payload: TaskPayload,
        delay: Duration,
    ) -> Result<String, ClientError> {
        if delay.is_zero() {
            return self.enqueue(task_name, payload).await;
        }

        let now = self.clock.now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or(ClientError::InvalidDelay(delay))?;
        let correlation_id = new_correlation_id();
        let message = self
            .build(task_name, &payload, &correlation_id)?
            .with_header(headers::SCHEDULED_AT, due.timestamp().to_string())
            .with_header(headers::SCHEDULED_FOR, rfc3339(due))
            .with_header(headers::ORIGINAL_TASK, task_name)
            .with_header(headers::ENQUEUED_AT, rfc3339(now));

        self.transport.publish(&self.topics.delayed, message).await?;
        info!(
            task = %task_name,
            correlation_id = %correlation_id,
            due = %due,
            "delayed task enqueued"
        );
        Ok(correlation_id)
    }

    /// Release the transport. Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.transport.close().await?;
        Ok(())
    }

    fn build(
        &self,
        task_name: &str,
        payload: &TaskPayload,
        correlation_id: &str,
    ) -> Result<Message, ClientError> {
        if task_name.trim().is_empty() {
            return Err(ClientError::EmptyTaskName);
        }
        Ok(Message::new(task_name, payload.to_wire()?)
            .with_header(headers::CORRELATION_ID, correlation_id))
    }
}

#[async_trait]
impl<T: Transport> TaskEnqueuer for Client<T> {
    async fn enqueue(&self, task_name: &str, payload: TaskPayload) -> Result<String, ClientError> {
        Client::enqueue(self, task_name, payload).await
    }

    async fn close(&self) -> Result<(), ClientError> {
        Client::close(self).await
    }
}

/// Timestamp format used in every header.
pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use taskforge_core::ManualClock;
    use taskforge_transport::InMemoryBroker;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn enqueue_publishes_to_active_topic() {
        let broker = InMemoryBroker::new();
        let client = Client::new(broker.connect(), QueueTopics::new("tasks"));

        let payload = TaskPayload::new().with("to", json!("a@example.com"));
        let correlation_id = client.enqueue("send_email", payload.clone()).await.unwrap();

        let messages = broker.messages("tasks");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, "send_email");
        assert_eq!(messages[0].header(headers::CORRELATION_ID), Some(correlation_id.as_str()));
        assert_eq!(TaskPayload::from_wire(&messages[0].payload).unwrap(), payload);
        assert!(broker.messages("tasks.delayed").is_empty());
    }

    #[tokio::test]
    async fn delayed_enqueue_goes_to_waiting_topic_with_due_time() {
        let broker = InMemoryBroker::new();
        let clock = clock();
        let client =
            Client::new(broker.connect(), QueueTopics::new("tasks")).with_clock(clock.clone());

        client
            .enqueue_delayed("report", TaskPayload::new(), Duration::from_secs(90))
            .await
            .unwrap();

        assert!(broker.messages("tasks").is_empty());
        let delayed = broker.messages("tasks.delayed");
        assert_eq!(delayed.len(), 1);

        let due = Utc.with_ymd_and_hms(2026, 3, 2, 12, 1, 30).unwrap();
        assert_eq!(
            delayed[0].header(headers::SCHEDULED_AT),
            Some(due.timestamp().to_string().as_str())
        );
        assert_eq!(delayed[0].header(headers::SCHEDULED_FOR), Some("2026-03-02T12:01:30.000Z"));
        assert_eq!(delayed[0].header(headers::ORIGINAL_TASK), Some("report"));
        assert_eq!(delayed[0].header(headers::ENQUEUED_AT), Some("2026-03-02T12:00:00.000Z"));
    }

    #[tokio::test]
    async fn zero_delay_is_immediate() {
        let broker = InMemoryBroker::new();
        let client = Client::new(broker.connect(), QueueTopics::new("tasks"));

        client
            .enqueue_delayed("ping", TaskPayload::new(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(broker.messages("tasks").len(), 1);
        assert!(broker.messages("tasks.delayed").is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_delay_is_rejected() {
        let broker = InMemoryBroker::new();
        let client = Client::new(broker.connect(), QueueTopics::default());

        let err = client
            .enqueue_delayed("t", TaskPayload::new(), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidDelay(_)));
        assert!(broker.messages("tasks.delayed").is_empty());
    }

    #[tokio::test]
    async fn empty_task_name_is_rejected() {
        let broker = InMemoryBroker::new();
        let client = Client::new(broker.connect(), QueueTopics::new("tasks"));

        let err = client.enqueue("  ", TaskPayload::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::EmptyTaskName));
        assert!(broker.messages("tasks").is_empty());
    }

    #[tokio::test]
    async fn closed_client_fails_to_enqueue() {
        let broker = InMemoryBroker::new();
        let client = Client::new(broker.connect(), QueueTopics::new("tasks"));

        client.close().await.unwrap();
        client.close().await.unwrap();

        let err = client.enqueue("t", TaskPayload::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Closed)));
    }
}
