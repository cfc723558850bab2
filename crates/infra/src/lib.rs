//! Runtime components: client, worker server, cron scheduler, delayed-task
//! promoter, plus broker adapters.

pub mod client;
pub mod config;
pub mod promoter;
pub mod scheduler;
pub mod server;
pub mod transport;

mod integration_tests;

pub use client::{Client, ClientError, TaskEnqueuer};
pub use config::QueueTopics;
pub use promoter::{Promoter, PromoterConfig, PromoterError};
pub use scheduler::{CronJobSnapshot, JobRegistry, Scheduler, SchedulerConfig, SchedulerError};
pub use server::{
    ProcessOutcome, RetryMetadataStore, Server, ServerConfig, ServerError, ServerStats,
    UnknownTaskPolicy,
};
