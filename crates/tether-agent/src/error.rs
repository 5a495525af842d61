use thiserror::Error;

/// Errors that can occur while running the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The channel to the controller failed.
    #[error("channel error: {0}")]
    Channel(#[from] tether_common::ChannelError),
    /// The session key could not be loaded.
    #[error("session key error: {0}")]
    Key(#[from] tether_common::cipher::CipherError),
}
