use thiserror::Error;

/// Errors produced by the relay and session layers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("transport send failed: {0}")]
    TransportSend(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::InvalidMessage(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
