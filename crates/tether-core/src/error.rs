use thiserror::Error;

/// Errors produced by the tether protocol layer.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("blocking call from the protocol loop thread would deadlock")]
    WouldDeadlock,

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("forward error: {0}")]
    Forward(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Codec(e.to_string())
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
