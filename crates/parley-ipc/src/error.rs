use thiserror::Error;

use parley_core::TransportError;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge process not running")]
    ProcessNotRunning,

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Bun install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("{command} failed: {reason}")]
    CommandFailed { command: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl From<IpcError> for TransportError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Timeout => TransportError::Timeout,
            IpcError::CommandFailed { reason, .. } => TransportError::Rejected(reason),
            other => TransportError::Unavailable(other.to_string()),
        }
    }
}
