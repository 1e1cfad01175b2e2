use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

/// Failure of a call against the hosted platform (or its local stand-in).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("row not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("database failure: {0}")]
    Database(String),
    #[error("failed to decode backend payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("realtime channel closed")]
    Closed,
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return BackendError::Transport(format!("undecodable response body: {value}"));
        }
        BackendError::Transport(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        BackendError::Transport(value.to_string())
    }
}
