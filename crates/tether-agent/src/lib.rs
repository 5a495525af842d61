//! Tether agent: execution slots, task dispatch and the daemon accept loop.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Built-in task handlers.
pub mod builtin;
/// CLI argument parsing and agent configuration.
pub mod config;
/// Per-connection envelope dispatch.
pub mod dispatch;
/// Error types for agent operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Accept loop and shared agent state.
pub mod server;
/// Execution slots and the pool tasks are submitted to.
pub mod slot;
/// Task handlers, contexts and records.
pub mod task;

pub use server::{run, run_with_shutdown, AgentState};
pub use slot::{SlotError, SlotId, SlotPool, TaskHandle, TaskRequest};
pub use task::{TaskContext, TaskFailure, TaskHandler, TaskRegistry};
