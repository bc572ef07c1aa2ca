//! Error types for approval-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// A requested row does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint rejected the write
    #[error("Constraint conflict: {0}")]
    Conflict(String),

    /// Evidence could not be read (query timeout, scanner store offline)
    #[error("Evidence unavailable: {0}")]
    EvidenceUnavailable(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Backend (database) error
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a retry of the whole job may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::EvidenceUnavailable(_)
                | StorageError::Backend(_)
                | StorageError::Conflict(_)
        )
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        // Unique index rejections surface as "... already contains ..."
        if message.contains("already contains") {
            StorageError::Conflict(message)
        } else {
            StorageError::Backend(message)
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
