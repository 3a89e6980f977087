use thiserror::Error;

/// Errors produced by the ttycast protocol layer and broker.
#[derive(Debug, Error)]
pub enum CastError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transcript error: {0}")]
    Transcript(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type CastResult<T> = Result<T, CastError>;
