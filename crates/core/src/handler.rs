//! Task handler contract.
//!
//! Handlers are owned by application code and registered by task name with a
//! worker server. The core treats them as opaque: it only looks at whether the
//! returned result is `Ok`, and at the error text when it is not.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::payload::TaskPayload;

/// Per-execution context handed to a handler alongside the payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Name the task was enqueued under.
    pub task_name: String,
    /// Identifier shared by every retry of one logical task.
    pub correlation_id: String,
    /// Failed attempts before this one (0 on first delivery).
    pub retry_count: u32,
    /// Composite transport position of the message being processed.
    pub position: String,
    /// Cancelled when the worker is shutting down.
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task_name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            correlation_id: correlation_id.into(),
            retry_count: 0,
            position: String::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run the task. `Err` is classified by the retry policy using its text.
    async fn handle(&self, ctx: TaskContext, payload: TaskPayload) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, TaskPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, payload: TaskPayload) -> anyhow::Result<()> {
        (self)(ctx, payload).await
    }
}
