//! Delayed-task promoter: moves due messages from the waiting topic to the
//! active topic.
//!
//! Waiting messages are consumed as they arrive and held, unacknowledged, in a
//! min-heap keyed by due time. The heap is checked after every receive and at
//! least once per `poll_interval`; the consumer's wait is shortened to the next
//! due time so promotion is prompt. A message is acknowledged on the waiting
//! topic only after its copy is on the active topic, so a crash before
//! promotion leaves it pending for redelivery.
//!
//! Due time comes from `scheduled_for` (RFC3339), falling back to
//! `scheduled_at` (Unix seconds). Messages with neither are promoted at once.

mod delay_queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskforge_core::{Clock, SystemClock, headers};
use taskforge_transport::{Consumer, Delivery, Message, Transport, TransportError};

use crate::client::rfc3339;
use crate::config::QueueTopics;

pub use delay_queue::DelayQueue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoterConfig {
    pub topics: QueueTopics,
    /// Consumer group on the waiting topic.
    pub group: String,
    /// Upper bound between due-time checks.
    pub poll_interval: Duration,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            topics: QueueTopics::default(),
            group: "taskforge-promoter".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl PromoterConfig {
    pub fn new(topics: QueueTopics) -> Self {
        Self {
            topics,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Error)]
pub enum PromoterError {
    #[error("promoter is already running")]
    AlreadyRunning,

    #[error("promoter has been stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub struct Promoter<T: Transport> {
    transport: T,
    config: PromoterConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl<T: Transport> Promoter<T> {
    pub fn new(transport: T, config: PromoterConfig) -> Self {
        Self {
            transport,
            config,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Promote until `cancel` fires or [`Promoter::stop`] is called.
    ///
    /// Messages still waiting when the loop exits stay unacknowledged.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), PromoterError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PromoterError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PromoterError::AlreadyRunning);
        }

        let result = self.run(&cancel).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Halt the loop and release the transport. Idempotent.
    pub async fn stop(&self) -> Result<(), PromoterError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.transport.close().await?;
        info!(topic = %self.config.topics.delayed, "promoter shut down");
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), PromoterError> {
        let mut consumer = self
            .transport
            .subscribe(&self.config.topics.delayed, &self.config.group)
            .await?;
        let mut waiting: DelayQueue<Delivery> = DelayQueue::new();

        info!(
            from = %self.config.topics.delayed,
            to = %self.config.topics.active,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "promoter started"
        );

        loop {
            let wait = self.next_wait(&waiting);
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                received = consumer.recv(wait) => received,
            };

            match received {
                Ok(Some(delivery)) => self.hold(&mut waiting, delivery),
                Ok(None) => {}
                Err(TransportError::Closed)
                    if cancel.is_cancelled() || self.shutdown.is_cancelled() =>
                {
                    break;
                }
                Err(err) => {
                    error!(error = %err, "transport failure, promoter exiting");
                    return Err(err.into());
                }
            }

            self.promote_due(consumer.as_mut(), &mut waiting).await?;
        }

        if !waiting.is_empty() {
            info!(held = waiting.len(), "promoter exiting with tasks still waiting");
        }
        Ok(())
    }

    fn hold(&self, waiting: &mut DelayQueue<Delivery>, delivery: Delivery) {
        let due = due_at(&delivery.message).unwrap_or_else(|| self.clock.now());
        debug!(position = %delivery.position, due = %due, "delayed task held");
        waiting.push(due, delivery);
    }

    fn next_wait(&self, waiting: &DelayQueue<Delivery>) -> Duration {
        let Some(due) = waiting.next_due() else {
            return self.config.poll_interval;
        };
        let until_due = (due - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        until_due
            .min(self.config.poll_interval)
            .max(Duration::from_millis(1))
    }

    async fn promote_due(
        &self,
        consumer: &mut dyn Consumer,
        waiting: &mut DelayQueue<Delivery>,
    ) -> Result<(), PromoterError> {
        let now = self.clock.now();
        for delivery in waiting.pop_due(now) {
            let mut message = delivery.message.clone();
            message.set_header(headers::PROMOTED_AT, rfc3339(now));

            self.transport
                .publish(&self.config.topics.active, message)
                .await?;
            consumer.ack(&delivery).await?;

            debug!(
                task = %delivery.message.key,
                position = %delivery.position,
                "delayed task promoted"
            );
        }
        Ok(())
    }
}

/// When a waiting message becomes due. `None` if it carries no usable time.
pub fn due_at(message: &Message) -> Option<DateTime<Utc>> {
    if let Some(raw) = message.header(headers::SCHEDULED_FOR) {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => return Some(at.with_timezone(&Utc)),
            Err(err) => warn!(value = %raw, error = %err, "unparseable scheduled_for header"),
        }
    }

    let secs = message.header(headers::SCHEDULED_AT)?.parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
