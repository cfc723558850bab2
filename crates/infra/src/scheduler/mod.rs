//! Cron scheduler: enqueues registered jobs through a [`TaskEnqueuer`] when due.
//!
//! Each tick collects the enabled jobs whose `next_run` has passed and fires
//! one enqueue per job, concurrently. A job only advances (`last_run = now`,
//! `next_run` recomputed from `now`) when its enqueue succeeds; a failed
//! enqueue leaves it due for the next tick. A job with `max_concurrent`
//! enqueues still in flight is skipped for the tick.

mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskforge_core::{Clock, CronExpression, SystemClock, TaskPayload};

use crate::client::{ClientError, TaskEnqueuer};

pub use registry::{CronJobSnapshot, JobRegistry};
use registry::CronJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often due jobs are checked.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job already registered: {0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("max_concurrent must be at least 1")]
    InvalidConcurrency,

    #[error("tick interval must be greater than zero")]
    InvalidInterval,

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler has been stopped")]
    Stopped,

    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

pub struct Scheduler<E: TaskEnqueuer> {
    enqueuer: Arc<E>,
    registry: Arc<JobRegistry>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl<E: TaskEnqueuer> Scheduler<E> {
    pub fn new(enqueuer: E, config: SchedulerConfig) -> Self {
        Self::from_arc(Arc::new(enqueuer), config)
    }

    pub fn from_arc(enqueuer: Arc<E>, config: SchedulerConfig) -> Self {
        Self {
            enqueuer,
            registry: Arc::new(JobRegistry::new()),
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

    pub fn with_registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Register a job. Its first run is the first schedule match after now.
    pub async fn add_job(
        &self,
        id: impl Into<String>,
        task_name: impl Into<String>,
        schedule: CronExpression,
        payload: TaskPayload,
    ) -> Result<(), SchedulerError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SchedulerError::EmptyJobId);
        }
        let task_name = task_name.into();

        let job = CronJob::new(id.clone(), task_name.clone(), schedule, payload, self.clock.now());
        let next_run = job.state.lock().await.next_run;
        self.registry.insert(job).await?;

        info!(job = %id, task = %task_name, schedule = %schedule, next_run = %next_run, "cron job added");
        Ok(())
    }

    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.registry.remove(id).await?;
        info!(job = %id, "cron job removed");
        Ok(())
    }

    pub async fn enable_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(id, false).await
    }

    /// Cap on this job's simultaneously outstanding enqueues (default 1).
    pub async fn set_max_concurrent(&self, id: &str, max: usize) -> Result<(), SchedulerError> {
        if max == 0 {
            return Err(SchedulerError::InvalidConcurrency);
        }
        let job = self.registry.get(id).await?;
        job.state.lock().await.max_concurrent = max;
        Ok(())
    }

    pub async fn job(&self, id: &str) -> Option<CronJobSnapshot> {
        self.registry.snapshot(id).await
    }

    pub async fn jobs(&self) -> Vec<CronJobSnapshot> {
        self.registry.snapshots().await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let job = self.registry.get(id).await?;
        job.state.lock().await.enabled = enabled;
        info!(job = %id, enabled, "cron job toggled");
        Ok(())
    }

    /// Fire every job due at `now`. Returns the spawned enqueues; the state of
    /// each job is updated when its enqueue completes.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut spawned = Vec::new();

        for job in self.registry.all().await {
            {
                let mut state = job.state.lock().await;
                if !state.enabled || state.next_run > now {
                    continue;
                }
                if state.in_flight >= state.max_concurrent {
                    debug!(job = %job.id, in_flight = state.in_flight, "previous run still in flight, skipping");
                    continue;
                }
                state.in_flight += 1;
            }

            let enqueuer = self.enqueuer.clone();
            spawned.push(tokio::spawn(async move {
                let result = enqueuer.enqueue(&job.task_name, job.payload.clone()).await;

                let mut state = job.state.lock().await;
                state.in_flight = state.in_flight.saturating_sub(1);
                match result {
                    Ok(correlation_id) => {
                        state.last_run = Some(now);
                        state.next_run = job.schedule.next_run(now);
                        info!(
                            job = %job.id,
                            task = %job.task_name,
                            correlation_id = %correlation_id,
                            next_run = %state.next_run,
                            "cron job enqueued"
                        );
                    }
                    Err(err) => {
                        warn!(job = %job.id, task = %job.task_name, error = %err, "cron enqueue failed");
                    }
                }
            }));
        }

        spawned
    }

    /// Tick every `tick_interval` until `cancel` fires or [`Scheduler::stop`] is called.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        if self.config.tick_interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(interval_ms = self.config.tick_interval.as_millis() as u64, "cron scheduler started");

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let fired = self.tick(self.clock.now()).await;
                    if !fired.is_empty() {
                        debug!(jobs = fired.len(), "cron tick fired jobs");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("cron scheduler stopped");
        Ok(())
    }

    /// Halt the loop and close the enqueuer. Idempotent.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.enqueuer.close().await?;
        Ok(())
    }
}
