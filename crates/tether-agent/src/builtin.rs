//! Handlers every agent registers out of the box.

use crate::task::{TaskContext, TaskFailure, TaskHandler, TaskRegistry};
use async_trait::async_trait;
use std::time::Duration;

/// Returns its payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<Vec<u8>, TaskFailure> {
        ctx.checkpoint()?;
        Ok(payload)
    }
}

/// Sleeps for the number of milliseconds given as a decimal payload, then
/// returns the payload. Stops early when interrupted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepTask;

#[async_trait]
impl TaskHandler for SleepTask {
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<Vec<u8>, TaskFailure> {
        let millis: u64 = std::str::from_utf8(&payload)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| TaskFailure::Failed("sleep expects a decimal millisecond count".into()))?;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(millis)) => Ok(payload),
            () = ctx.cancelled() => Err(TaskFailure::Interrupted),
        }
    }
}

/// Registry holding `echo` and `sleep`.
#[must_use]
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", EchoTask).register("sleep", SleepTask);
    registry
}
