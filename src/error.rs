//! Error types for the batch engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Resume error: {0}")]
    Resume(#[from] ResumeError),
}

/// Configuration-related errors.
///
/// The only category that reaches the caller as a hard failure, and only at
/// task construction, never after work has been dispatched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required target identifier: {field}")]
    MissingTarget { field: &'static str },

    #[error("Concurrency {value} outside allowed range {min}-{max}")]
    ConcurrencyOutOfRange {
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("Invalid accuracy range {lo}-{hi}")]
    InvalidAccuracyRange { lo: u8, hi: u8 },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Task has no units to process")]
    EmptyUnitPlan,
}

/// Persistence errors from the progress store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure to retrieve a unit's item list from the executor collaborator.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Remote request failed: {0}")]
    Request(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Errors rehydrating a persisted task.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Task {task_id} is {status}, only paused tasks can be resumed")]
    NotResumable { task_id: String, status: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
