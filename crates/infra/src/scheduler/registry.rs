//! Registered cron jobs and their mutable run state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use taskforge_core::{CronExpression, TaskPayload};

use super::SchedulerError;

#[derive(Debug)]
pub(crate) struct JobState {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    pub max_concurrent: usize,
    pub in_flight: usize,
}

/// A registered job. Identity fields are fixed; run state sits behind a
/// per-job lock so enqueue completions never contend on the registry.
#[derive(Debug)]
pub(crate) struct CronJob {
    pub id: String,
    pub task_name: String,
    pub schedule: CronExpression,
    pub payload: TaskPayload,
    pub state: Mutex<JobState>,
}

impl CronJob {
    pub fn new(
        id: String,
        task_name: String,
        schedule: CronExpression,
        payload: TaskPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_name,
            payload,
            state: Mutex::new(JobState {
                last_run: None,
                next_run: schedule.next_run(now),
                enabled: true,
                max_concurrent: 1,
                in_flight: 0,
            }),
            schedule,
        }
    }

    pub async fn snapshot(&self) -> CronJobSnapshot {
        let state = self.state.lock().await;
        CronJobSnapshot {
            id: self.id.clone(),
            task_name: self.task_name.clone(),
            schedule: self.schedule,
            payload: self.payload.clone(),
            last_run: state.last_run,
            next_run: state.next_run,
            enabled: state.enabled,
            max_concurrent: state.max_concurrent,
            in_flight: state.in_flight,
        }
    }
}

/// Point-in-time copy of a job, safe to hand out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronJobSnapshot {
    pub id: String,
    pub task_name: String,
    pub schedule: CronExpression,
    pub payload: TaskPayload,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    pub max_concurrent: usize,
    pub in_flight: usize,
}

/// Job table shared by the scheduler loop and the management API.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<CronJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(&self, job: CronJob) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateJob(job.id));
        }
        jobs.insert(job.id.clone(), Arc::new(job));
        Ok(())
    }

    pub(crate) async fn remove(&self, id: &str) -> Result<(), SchedulerError> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    pub(crate) async fn get(&self, id: &str) -> Result<Arc<CronJob>, SchedulerError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    /// Every job, in no particular order. The registry lock is released on return.
    pub(crate) async fn all(&self) -> Vec<Arc<CronJob>> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn snapshot(&self, id: &str) -> Option<CronJobSnapshot> {
        let job = self.jobs.read().await.get(id).cloned()?;
        Some(job.snapshot().await)
    }

    /// Snapshots of every job, sorted by id.
    pub async fn snapshots(&self) -> Vec<CronJobSnapshot> {
        let mut out = Vec::new();
        for job in self.all().await {
            out.push(job.snapshot().await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
