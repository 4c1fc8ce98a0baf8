//! Coordination service errors.

use std::fmt;

use crate::store::StoreError;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the coordination service.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Failed to decode payload on topic '{topic}': {message}")]
    Decode { topic: String, message: String },

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("Coordination service is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription worker failed: {0}")]
    Fatal(String),

    #[error("Worker task '{name}' failed: {message}")]
    Worker { name: String, message: String },
}

impl SyncError {
    /// True when the error reports the caller's own cancellation or deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Canceled | SyncError::DeadlineExceeded)
    }
}

/// Every failure collected while tearing the service down.
#[derive(Debug)]
pub struct TeardownError {
    pub errors: Vec<SyncError>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) during teardown", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { ": " } else { "; " }, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}
