//! Error taxonomy for the reconciliation engine.

use approval_state::{MergeRequestId, PipelineId, StorageError};

/// Errors produced while reconciling approval rules.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("comment notifier failed: {0}")]
    Notifier(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("merge request not found: {0}")]
    MergeRequestNotFound(MergeRequestId),
}

impl SyncError {
    /// Whether re-running the job may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Storage(e) => e.is_transient(),
            SyncError::Dispatch(_) => true,
            SyncError::Notifier(_)
            | SyncError::PipelineNotFound(_)
            | SyncError::MergeRequestNotFound(_) => false,
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, SyncError>;
