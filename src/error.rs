//! Error types for the vocabulary question generator.

use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(String),

    #[error("Storage data error: {0}")]
    DataError(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Orchestrator-level errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Provider request failed: {0}")]
    ProviderRequestFailed(String),

    #[error("Provider returned status {status}: {body}")]
    ProviderStatus {
        status: u16,
        retry_after: Option<String>,
        body: String,
    },

    #[error("Provider returned an empty completion")]
    ProviderEmptyResponse,

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No vocabulary entries found for start id {start_word_id} (limit {limit})")]
    NoVocabulary { start_word_id: u64, limit: usize },

    #[error("Regeneration failed: {0}")]
    RegenerationFailed(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Session runtime already started: {0}")]
    AlreadyStarted(String),

    #[error("Worker loop aborted: {0}")]
    WorkerPanicked(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Control channel: {0}")]
    ControlChannel(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

impl ApiError {
    /// Whether a failed completion attempt may be retried.
    ///
    /// Only network failures and 429/503 responses qualify; every other
    /// provider outcome is terminal for the item.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::ProviderRequestFailed(_) => true,
            ApiError::ProviderStatus { status, .. } => matches!(status, 429 | 503),
            _ => false,
        }
    }
}
