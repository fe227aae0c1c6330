use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Upstream resource unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Validator failed: {0}")]
    ValidatorFailed(String),
    #[error("Knowledge search failed: {0}")]
    KmFailed(String),
    #[error("Answer generation failed: {0}")]
    LlmFailed(String),
    #[error("Speech synthesis failed: {0}")]
    TtsFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Client disconnected")]
    ClientDisconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors the answer flow survives by falling back (identity validation,
    /// empty document set). Everything else short-circuits the stage.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::ValidatorFailed(_) | CoreError::KmFailed(_))
    }
}
