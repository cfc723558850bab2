//! Worker server: consumes the active topic and runs registered handlers.
//!
//! Per message: parse, look up the handler, dispatch (panics contained), then
//! one of
//! - **ack** on success,
//! - **retry**: republish to the waiting topic with a backoff due time, ack the
//!   original,
//! - **dead-letter**: publish to the DLQ topic with full diagnostics, ack the
//!   original,
//! - **skip/requeue** when no handler is registered (never dead-lettered).
//!
//! The failed-attempt count travels in the `retry_attempt` header, so retry
//! budgets survive restarts even though [`RetryMetadataStore`] does not.

mod dispatch;
pub mod metadata;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskforge_core::{
    Clock, ProcessingStep, RetryPolicy, SystemClock, TaskContext, TaskHandler, TaskMetadata,
    TaskPayload, headers, new_correlation_id,
};
use taskforge_transport::{Consumer, Delivery, Message, Transport, TransportError};

use crate::client::rfc3339;
use crate::config::QueueTopics;

pub use metadata::RetryMetadataStore;

/// What to do with a message whose task name has no handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTaskPolicy {
    /// Acknowledge and drop it.
    #[default]
    Skip,
    /// Wait `requeue_delay`, then hand it back to the group.
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub topics: QueueTopics,
    /// Consumer group shared by every worker on this queue.
    pub group: String,
    /// Longest single wait for the next message.
    pub poll_timeout: Duration,
    pub unknown_task: UnknownTaskPolicy,
    pub requeue_delay: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            topics: QueueTopics::default(),
            group: "taskforge-workers".to_string(),
            poll_timeout: Duration::from_secs(1),
            unknown_task: UnknownTaskPolicy::Skip,
            requeue_delay: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
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

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_unknown_task(mut self, policy: UnknownTaskPolicy) -> Self {
        self.unknown_task = policy;
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server has been stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// How a single message was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    Retried,
    DeadLettered,
    Skipped,
    Requeued,
}

/// Counters since the server was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct Server<T: Transport> {
    transport: T,
    config: ServerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    policy: RwLock<RetryPolicy>,
    metadata: Arc<RetryMetadataStore>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    shutdown: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        Self {
            transport,
            policy: RwLock::new(config.retry_policy.clone()),
            config,
            handlers: RwLock::new(HashMap::new()),
            metadata: Arc::new(RetryMetadataStore::new()),
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metadata_store(mut self, store: Arc<RetryMetadataStore>) -> Self {
        self.metadata = store;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Route messages keyed `task_name` to `handler`, replacing any previous one.
    pub async fn register_handler<H>(&self, task_name: impl Into<String>, handler: H)
    where
        H: TaskHandler,
    {
        let task_name = task_name.into();
        let previous = self
            .handlers
            .write()
            .await
            .insert(task_name.clone(), Arc::new(handler));
        if previous.is_some() {
            debug!(task = %task_name, "handler replaced");
        } else {
            debug!(task = %task_name, "handler registered");
        }
    }

    /// Replace the retry policy; applies to failures from now on.
    pub async fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.policy.write().await = policy;
    }

    pub async fn retry_policy(&self) -> RetryPolicy {
        self.policy.read().await.clone()
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consume until `cancel` fires or [`Server::stop`] is called.
    ///
    /// Returns `Err` on transport failure. Handler failures never end the loop.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.run(cancel).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Halt consumption and release the transport. Idempotent.
    pub async fn stop(&self) -> Result<(), ServerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.transport.close().await?;
        info!(topic = %self.config.topics.active, "worker server shut down");
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        // Fires on either the caller's token or stop(); handlers see it too.
        let scope = self.shutdown.child_token();
        let _scope_guard = scope.clone().drop_guard();
        {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => scope.cancel(),
                    _ = scope.cancelled() => {}
                }
            });
        }

        let mut consumer = self
            .transport
            .subscribe(&self.config.topics.active, &self.config.group)
            .await?;

        info!(
            topic = %self.config.topics.active,
            group = %self.config.group,
            "worker server started"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                received = consumer.recv(self.config.poll_timeout) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.process(consumer.as_mut(), delivery, &scope).await?;
                }
                Ok(None) => {}
                Err(TransportError::Closed) if scope.is_cancelled() => break,
                Err(err) => {
                    error!(error = %err, "transport failure, worker server exiting");
                    return Err(err.into());
                }
            }
        }

        info!(topic = %self.config.topics.active, "worker server loop exited");
        Ok(())
    }

    /// Resolve one delivery: run it and ack, retry, dead-letter or skip it.
    pub async fn process(
        &self,
        consumer: &mut dyn Consumer,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ServerError> {
        Counters::bump(&self.counters.processed);

        let received_at = self.clock.now();
        let key = delivery.position.to_string();
        let message = &delivery.message;
        let task_name = message.key.clone();

        let policy = self.policy.read().await.clone();
        // A header past the budget still gets one final attempt.
        let prior_failures = message
            .header(headers::RETRY_ATTEMPT)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            .min(policy.max_retries.saturating_sub(1));
        let correlation_id = message
            .header(headers::CORRELATION_ID)
            .map(str::to_string)
            .unwrap_or_else(new_correlation_id);
        let first_seen = message
            .header(headers::FIRST_SEEN_AT)
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        let mut trail = TaskMetadata::new(
            delivery.position.topic.clone(),
            delivery.position.partition,
            delivery.position.offset.clone(),
            correlation_id.clone(),
            first_seen,
        );
        trail.retry_count = prior_failures;
        trail.record(ProcessingStep::Received, received_at);

        let payload = match TaskPayload::from_wire(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                let error = format!("malformed payload: {err}");
                warn!(task = %task_name, position = %key, error = %error, "cannot parse task payload");
                trail.record_failure(error, self.clock.now());
                self.metadata.put(key.clone(), trail.clone()).await;
                return self.dead_letter(consumer, &delivery, &key, trail).await;
            }
        };
        trail.record(ProcessingStep::Parsed, self.clock.now());

        let handler = self.handlers.read().await.get(&task_name).cloned();
        let Some(handler) = handler else {
            return self.unknown_task(consumer, &delivery, cancel).await;
        };

        let ctx = TaskContext {
            task_name: task_name.clone(),
            correlation_id,
            retry_count: prior_failures,
            position: key.clone(),
            cancellation: cancel.child_token(),
        };
        trail.record(ProcessingStep::Dispatched, self.clock.now());
        debug!(task = %task_name, position = %key, attempt = prior_failures + 1, "dispatching task");

        match dispatch::dispatch(handler, ctx, payload).await {
            Ok(()) => {
                consumer.ack(&delivery).await?;
                self.metadata.remove(&key).await;
                Counters::bump(&self.counters.succeeded);
                debug!(task = %task_name, position = %key, "task succeeded");
                Ok(ProcessOutcome::Succeeded)
            }
            Err(error) => {
                trail.record_failure(error, self.clock.now());
                self.metadata.put(key.clone(), trail.clone()).await;
                self.handle_failure(consumer, &delivery, &key, trail, &policy).await
            }
        }
    }

    async fn handle_failure(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        key: &str,
        trail: TaskMetadata,
        policy: &RetryPolicy,
    ) -> Result<ProcessOutcome, ServerError> {
        let error = trail.last_error.clone().unwrap_or_default();

        if policy.should_retry(trail.retry_count, &error) {
            let backoff = policy.calculate_backoff(trail.retry_count);
            self.schedule_retry(consumer, delivery, key, trail, backoff).await
        } else {
            self.dead_letter(consumer, delivery, key, trail).await
        }
    }

    async fn schedule_retry(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        key: &str,
        mut trail: TaskMetadata,
        backoff: Duration,
    ) -> Result<ProcessOutcome, ServerError> {
        let now = self.clock.now();
        let due = now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        trail.record(ProcessingStep::Retried, now);
        self.metadata.put(key, trail.clone()).await;

        let error = trail.last_error.clone().unwrap_or_default();
        let mut message = delivery.message.clone();
        message.headers.remove(headers::PROMOTED_AT);
        message.set_header(headers::RETRY_ATTEMPT, trail.retry_count.to_string());
        message.set_header(headers::SCHEDULED_FOR, rfc3339(due));
        message.set_header(headers::SCHEDULED_AT, due.timestamp().to_string());
        message.set_header(headers::BACKOFF_MS, backoff.as_millis().to_string());
        message.set_header(headers::CORRELATION_ID, trail.correlation_id.clone());
        message.set_header(headers::LAST_ERROR, error.clone());
        message.set_header(headers::FIRST_SEEN_AT, rfc3339(trail.first_seen));
        message.set_header(headers::ORIGINAL_TASK, delivery.message.key.clone());

        self.forward(consumer, delivery, key, &self.config.topics.delayed, message)
            .await?;
        Counters::bump(&self.counters.retried);

        warn!(
            task = %delivery.message.key,
            position = %key,
            correlation_id = %trail.correlation_id,
            attempt = trail.retry_count,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "task failed, retry scheduled"
        );
        Ok(ProcessOutcome::Retried)
    }

    async fn dead_letter(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        key: &str,
        mut trail: TaskMetadata,
    ) -> Result<ProcessOutcome, ServerError> {
        let now = self.clock.now();
        trail.record(ProcessingStep::DeadLettered, now);
        self.metadata.put(key, trail.clone()).await;

        let error = trail.last_error.clone().unwrap_or_default();
        let mut message = delivery.message.clone();
        message.set_header(headers::ERROR, error.clone());
        message.set_header(headers::RETRY_COUNT, trail.retry_count.to_string());
        message.set_header(headers::ORIGINAL_OFFSET, delivery.position.offset.clone());
        message.set_header(headers::ORIGINAL_TOPIC, delivery.position.topic.clone());
        message.set_header(headers::CORRELATION_ID, trail.correlation_id.clone());
        message.set_header(headers::METADATA, trail.to_header_value());
        message.set_header(headers::DLQ_TIMESTAMP, rfc3339(now));

        self.forward(consumer, delivery, key, &self.config.topics.dead_letter, message)
            .await?;
        Counters::bump(&self.counters.dead_lettered);

        error!(
            task = %delivery.message.key,
            position = %key,
            correlation_id = %trail.correlation_id,
            retry_count = trail.retry_count,
            error = %error,
            "task dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered)
    }

    /// Publish `message` to `topic`, then ack the original. The diagnostics
    /// entry is dropped whether or not that succeeds.
    async fn forward(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        key: &str,
        topic: &str,
        message: Message,
    ) -> Result<(), ServerError> {
        let routed = match self.transport.publish(topic, message).await {
            Ok(()) => consumer.ack(delivery).await,
            Err(err) => Err(err),
        };
        self.metadata.remove(key).await;
        Ok(routed?)
    }

    async fn unknown_task(
        &self,
        consumer: &mut dyn Consumer,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ServerError> {
        match self.config.unknown_task {
            UnknownTaskPolicy::Skip => {
                warn!(task = %delivery.message.key, position = %delivery.position, "no handler registered, skipping");
                consumer.ack(delivery).await?;
                Counters::bump(&self.counters.skipped);
                Ok(ProcessOutcome::Skipped)
            }
            UnknownTaskPolicy::Requeue => {
                warn!(
                    task = %delivery.message.key,
                    position = %delivery.position,
                    delay_ms = self.config.requeue_delay.as_millis() as u64,
                    "no handler registered, requeueing"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.requeue_delay) => {}
                    _ = cancel.cancelled() => {}
                }
                consumer.reject(delivery, true).await?;
                Counters::bump(&self.counters.skipped);
                Ok(ProcessOutcome::Requeued)
            }
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
