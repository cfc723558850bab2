//! Handler invocation with panic containment.

use std::any::Any;
use std::sync::Arc;

use taskforge_core::{TaskContext, TaskHandler, TaskPayload};

/// Run `handler` on its own task so a panic surfaces as an error string
/// instead of unwinding through the worker loop.
pub(crate) async fn dispatch(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
    payload: TaskPayload,
) -> Result<(), String> {
    let joined = tokio::spawn(async move { handler.handle(ctx, payload).await }).await;

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(join_err) if join_err.is_panic() => Err(format!(
            "handler panicked: {}",
            panic_message(join_err.into_panic().as_ref())
        )),
        Err(join_err) => Err(format!("handler aborted: {join_err}")),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
