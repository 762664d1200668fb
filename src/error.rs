use crate::models::TaskStatus;
use thiserror::Error;

/// Convenience alias for `Result<T, HubError>`.
pub type Result<T> = std::result::Result<T, HubError>;

/// All error kinds the coordination engine can surface to a caller.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: expected one of {expected:?}, found {actual:?}")]
    InvalidState {
        expected: Vec<TaskStatus>,
        actual: TaskStatus,
    },

    #[error("stale generation: expected {expected}, got {actual}")]
    StaleGeneration { expected: u64, actual: u64 },

    #[error("table corrupted: {table}")]
    TableCorrupted { table: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("budget exhausted for category {0}")]
    BudgetExhausted(String),

    #[error("unauthorized")]
    Unauthorized,
    #[error("agent not available: {0}")]
    AgentUnavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("queue is full")]
    QueueFull,

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn invalid_state(expected: Vec<TaskStatus>, actual: TaskStatus) -> Self {
        HubError::InvalidState { expected, actual }
    }
}
