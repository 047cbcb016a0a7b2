//! Grid engine error types

use thiserror::Error;

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid range: {0}")]
    InvalidRange(String),

    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway call '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Gateway call failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("{failed} of {total} actions failed")]
    PartialActionFailure { failed: usize, total: usize },

    #[error("Engine is in invalid state for operation: {current_state}")]
    InvalidState { current_state: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl GridError {
    /// Whether the failure is worth retrying (network, timeout, venue hiccup)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Gateway(_) | GridError::Timeout { .. } | GridError::ChannelClosed(_)
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Io(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
