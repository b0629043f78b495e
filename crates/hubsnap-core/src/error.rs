use thiserror::Error;

/// Application-wide error types for hubsnap.
#[derive(Error, Debug)]
pub enum AppError {
    /// A scrape attempt failed (page error, extraction failure, bad markup).
    #[error("Scrape error: {0}")]
    Scrape(String),

    /// Browser/driver operation failed (launch, tab, CDP call).
    #[error("Browser error: {0}")]
    Browser(String),

    /// Plain HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// LLM enrichment call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    Llm {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// A required key is absent from an upstream unit's payload.
    ///
    /// This is a structural-input error, not a soft scrape failure: it
    /// aborts the current unit's processing and is never retried.
    #[error("required key '{key}' not found in payload (present: {present:?})")]
    MissingKey { key: String, present: Vec<String> },

    /// Checkpoint write failed.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Checkpoint read/parse failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Snapshot merge failed.
    #[error("Merge error: {0}")]
    Merge(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Scrape(_) | AppError::Browser(_) | AppError::Timeout(_) => true,
            AppError::Llm { retryable, .. } => *retryable,
            AppError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error must abort the surrounding stage.
    ///
    /// Per-target failures become error records; only configuration and
    /// structural-input errors are allowed to stop a stage outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_))
    }
}
