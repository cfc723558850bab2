//! Built-in task handlers.

use anyhow::Context;
use tracing::info;

use taskforge_core::{TaskContext, TaskPayload};
use taskforge_infra::Server;
use taskforge_transport::Transport;

pub const HEARTBEAT: &str = "heartbeat";
pub const ECHO: &str = "echo";

pub async fn register<T: Transport>(server: &Server<T>) {
    server.register_handler(HEARTBEAT, heartbeat).await;
    server.register_handler(ECHO, echo).await;
}

async fn heartbeat(ctx: TaskContext, payload: TaskPayload) -> anyhow::Result<()> {
    info!(
        correlation_id = %ctx.correlation_id,
        source = payload.get_str("source").unwrap_or("unknown"),
        "heartbeat"
    );
    Ok(())
}

/// Logs the payload. A `message` field is required.
async fn echo(ctx: TaskContext, payload: TaskPayload) -> anyhow::Result<()> {
    let message = payload
        .get_str("message")
        .context("invalid input: echo needs a string `message` field")?;
    info!(
        correlation_id = %ctx.correlation_id,
        attempt = ctx.retry_count + 1,
        text = message,
        "echo"
    );
    Ok(())
}
