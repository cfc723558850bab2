//! End-to-end tests over the in-memory broker.
//!
//! Client → active topic → Server → (retry) waiting topic → Promoter → active
//! topic ... → DLQ, plus scheduler-driven enqueues.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use taskforge_core::{
        CronExpression, JitterMode, ManualClock, RetryPolicy, TaskContext, TaskPayload, headers,
    };
    use taskforge_transport::{InMemoryBroker, InMemoryTransport, Message, Transport};

    use crate::client::Client;
    use crate::config::QueueTopics;
    use crate::promoter::{Promoter, PromoterConfig};
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::server::{Server, ServerConfig};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .with_jitter(0.0, JitterMode::Deterministic)
    }

    struct Pipeline {
        broker: InMemoryBroker,
        client: Client<InMemoryTransport>,
        server: Arc<Server<InMemoryTransport>>,
        cancel: CancellationToken,
        running: Vec<JoinHandle<()>>,
    }

    impl Pipeline {
        fn new(policy: RetryPolicy) -> Self {
            let broker = InMemoryBroker::new();
            let topics = QueueTopics::new("tasks");
            let server = Server::new(
                broker.connect(),
                ServerConfig::new(topics.clone())
                    .with_poll_timeout(Duration::from_millis(20))
                    .with_retry_policy(policy),
            );
            Self {
                client: Client::new(broker.connect(), topics),
                server: Arc::new(server),
                broker,
                cancel: CancellationToken::new(),
                running: Vec::new(),
            }
        }

        /// Start the server and a promoter. Handlers must be registered first.
        fn start(&mut self) {
            let server = self.server.clone();
            let cancel = self.cancel.clone();
            self.running.push(tokio::spawn(async move {
                server.start(cancel).await.unwrap();
            }));

            let promoter = Promoter::new(
                self.broker.connect(),
                PromoterConfig::new(QueueTopics::new("tasks"))
                    .with_poll_interval(Duration::from_millis(10)),
            );
            let cancel = self.cancel.clone();
            self.running.push(tokio::spawn(async move {
                promoter.start(cancel).await.unwrap();
            }));
        }

        async fn shutdown(self) {
            self.cancel.cancel();
            for handle in self.running {
                handle.await.unwrap();
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn always_failing_task_runs_max_retries_times_then_dead_letters() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let correlation_ids = Arc::new(Mutex::new(Vec::new()));
        {
            let attempts = attempts.clone();
            let correlation_ids = correlation_ids.clone();
            pipeline
                .server
                .register_handler("flaky", move |ctx: TaskContext, _p: TaskPayload| {
                    let attempts = attempts.clone();
                    let correlation_ids = correlation_ids.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        correlation_ids.lock().unwrap().push(ctx.correlation_id);
                        Err::<(), anyhow::Error>(anyhow::anyhow!("upstream unavailable"))
                    }
                })
                .await;
        }
        pipeline.start();

        let correlation_id = pipeline
            .client
            .enqueue("flaky", TaskPayload::new().with("n", 1))
            .await
            .unwrap();

        let broker = pipeline.broker.clone();
        wait_until(|| broker.messages("tasks.dlq").len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(correlation_ids.lock().unwrap().iter().all(|id| *id == correlation_id));

        let dlq = broker.messages("tasks.dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].header(headers::RETRY_COUNT), Some("3"));
        assert_eq!(dlq[0].header(headers::ERROR), Some("upstream unavailable"));
        assert_eq!(dlq[0].header(headers::CORRELATION_ID), Some(correlation_id.as_str()));
        assert!(dlq[0].header(headers::DLQ_TIMESTAMP).is_some());

        let retries = broker.messages("tasks.delayed");
        let attempt_headers: Vec<_> = retries
            .iter()
            .map(|m| m.header(headers::RETRY_ATTEMPT).unwrap_or_default().to_string())
            .collect();
        assert_eq!(attempt_headers, vec!["1", "2"]);
        assert_eq!(retries[1].header(headers::BACKOFF_MS), Some("20"));

        let stats = pipeline.server.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dead_lettered, 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn non_retryable_error_dead_letters_after_one_attempt() {
        let mut pipeline = Pipeline::new(fast_policy(5).never_retry_on("invalid input"));
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            pipeline
                .server
                .register_handler("validate", move |_ctx: TaskContext, _p: TaskPayload| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), anyhow::Error>(anyhow::anyhow!("invalid input: missing email"))
                    }
                })
                .await;
        }
        pipeline.start();

        pipeline
            .client
            .enqueue("validate", TaskPayload::new())
            .await
            .unwrap();

        let broker = pipeline.broker.clone();
        wait_until(|| broker.messages("tasks.dlq").len() == 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.messages("tasks.dlq")[0].header(headers::RETRY_COUNT), Some("1"));
        assert!(broker.messages("tasks.delayed").is_empty());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_dispatch() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            pipeline
                .server
                .register_handler("add", move |_ctx: TaskContext, _p: TaskPayload| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    }
                })
                .await;
        }
        pipeline.start();

        let producer = pipeline.broker.connect();
        producer
            .publish("tasks", Message::new("add", b"{not json".to_vec()))
            .await
            .unwrap();

        let broker = pipeline.broker.clone();
        wait_until(|| broker.messages("tasks.dlq").len() == 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        let error = broker.messages("tasks.dlq")[0]
            .header(headers::ERROR)
            .unwrap_or_default()
            .to_string();
        assert!(error.starts_with("malformed payload"));
        assert!(broker.messages("tasks.delayed").is_empty());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_is_skipped_not_dead_lettered() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        pipeline.start();

        pipeline
            .client
            .enqueue("nobody_handles_this", TaskPayload::new())
            .await
            .unwrap();

        let server = pipeline.server.clone();
        wait_until(|| server.stats().skipped == 1).await;

        let broker = pipeline.broker.clone();
        assert!(broker.messages("tasks.dlq").is_empty());
        assert!(broker.messages("tasks.delayed").is_empty());
        assert_eq!(broker.pending("tasks", "taskforge-workers"), 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_is_retried_and_worker_keeps_running() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        pipeline
            .server
            .register_handler("explosive", |ctx: TaskContext, _p: TaskPayload| async move {
                if ctx.retry_count == 0 {
                    panic!("first attempt explodes");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await;
        pipeline.start();

        pipeline
            .client
            .enqueue("explosive", TaskPayload::new())
            .await
            .unwrap();

        let server = pipeline.server.clone();
        wait_until(|| server.stats().succeeded == 1).await;

        let retries = pipeline.broker.messages("tasks.delayed");
        assert_eq!(retries.len(), 1);
        assert!(
            retries[0]
                .header(headers::LAST_ERROR)
                .is_some_and(|e| e.contains("first attempt explodes"))
        );
        assert!(pipeline.broker.messages("tasks.dlq").is_empty());
        assert!(server.is_running());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_enqueue_runs_after_its_delay() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        let ran_at = Arc::new(Mutex::new(None));
        {
            let ran_at = ran_at.clone();
            pipeline
                .server
                .register_handler("reminder", move |_ctx: TaskContext, payload: TaskPayload| {
                    let ran_at = ran_at.clone();
                    async move {
                        assert_eq!(payload.get_str("user"), Some("u-1"));
                        *ran_at.lock().unwrap() = Some(Instant::now());
                        Ok::<(), anyhow::Error>(())
                    }
                })
                .await;
        }
        pipeline.start();

        let enqueued = Instant::now();
        pipeline
            .client
            .enqueue_delayed(
                "reminder",
                TaskPayload::new().with("user", "u-1"),
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        let observed = ran_at.clone();
        wait_until(|| observed.lock().unwrap().is_some()).await;

        let ran = ran_at.lock().unwrap().unwrap_or(enqueued);
        assert!(ran.duration_since(enqueued) >= Duration::from_millis(150));

        let active = pipeline.broker.messages("tasks");
        assert_eq!(active.len(), 1);
        assert!(active[0].header(headers::PROMOTED_AT).is_some());
        assert_eq!(active[0].header(headers::ORIGINAL_TASK), Some("reminder"));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn monthly_job_fires_once_across_a_month_boundary() {
        let broker = InMemoryBroker::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let client = Client::new(broker.connect(), QueueTopics::new("tasks"));
        let scheduler =
            Scheduler::new(client, SchedulerConfig::default()).with_clock(clock.clone());

        scheduler
            .add_job(
                "monthly-invoice",
                "generate_invoices",
                CronExpression::monthly(1, 0, 0),
                TaskPayload::new(),
            )
            .await
            .unwrap();

        for day in 0..=30 {
            let now = start + ChronoDuration::days(day);
            clock.set(now);
            for handle in scheduler.tick(now).await {
                handle.await.unwrap();
            }
        }

        let enqueued = broker.messages("tasks");
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].key, "generate_invoices");

        let job = scheduler.job("monthly-invoice").await.unwrap();
        let first_of_april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(job.last_run, Some(first_of_april));
        assert_eq!(job.next_run, Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopping_the_server_ends_its_loop() {
        let mut pipeline = Pipeline::new(fast_policy(3));
        pipeline.start();

        let server = pipeline.server.clone();
        wait_until(|| server.is_running()).await;
        server.stop().await.unwrap();
        wait_until(|| !server.is_running()).await;

        // The client's own handle is unaffected.
        pipeline
            .client
            .enqueue("later", TaskPayload::new())
            .await
            .unwrap();
        assert_eq!(pipeline.broker.messages("tasks").len(), 1);

        pipeline.shutdown().await;
    }
}
