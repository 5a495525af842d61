//! Tether controller: bootstraps agent connections and dispatches tasks.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI parsing and layered configuration.
pub mod config;
pub mod connect;
/// Error types for controller operations.
pub mod error;
/// Session secret generation.
pub mod keyfile;
pub mod remote;

pub use connect::{connect, establish, ConnectOptions};
pub use error::ControllerError;
pub use remote::{PendingTask, RemoteAgent};
