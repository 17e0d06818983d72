//! Error types for Millrun
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Millrun
#[derive(Debug, Error)]
pub enum MillrunError {
    /// Collaborator call failed transiently (timeout, rate limit);
    /// eligible for bounded retry with backoff
    #[error("Transient collaborator error: {0}")]
    TransientCollaborator(String),

    /// Input is unusable (malformed item, empty selection, unmet
    /// precondition); the attempt fails without automatic retry
    #[error("Permanent input error: {0}")]
    PermanentInput(String),

    /// Persisted state disagrees with itself; surfaced through audit
    /// findings, never auto-repaired
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Duplicate admission race lost; callers see a duplicate rejection,
    /// not this error
    #[error("Admission conflict: {0}")]
    AdmissionConflict(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite index error
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl MillrunError {
    /// Returns true if the error may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, MillrunError::TransientCollaborator(_))
    }
}

/// Result type alias for Millrun operations
pub type Result<T> = std::result::Result<T, MillrunError>;
