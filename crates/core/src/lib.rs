//! `taskforge-core`: task primitives shared by clients, workers and schedulers.
//!
//! Pure building blocks (no IO): payloads, the handler contract, retry policy,
//! failure metadata and cron expressions.

pub mod clock;
pub mod cron;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod payload;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{CronExpression, CronField};
pub use error::{CronParseError, PayloadError};
pub use handler::{TaskContext, TaskHandler};
pub use metadata::{ProcessingStep, StepRecord, TaskMetadata, headers, new_correlation_id};
pub use payload::TaskPayload;
pub use retry::{JitterMode, RetryPolicy};
