use thiserror::Error;

/// Errors surfaced while talking to an agent.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Underlying I/O error, including a missing channel marker.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The secure channel failed or was closed.
    #[error("channel error: {0}")]
    Channel(#[from] tether_common::ChannelError),
    /// The session key could not be loaded.
    #[error("session key error: {0}")]
    Key(#[from] tether_common::cipher::CipherError),
    /// Connecting and setting up the channel took too long.
    #[error("timed out connecting to agent at {0}")]
    ConnectTimeout(String),
}
