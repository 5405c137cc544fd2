use thiserror::Error;

use crate::models::{Category, TimeRange};

/// Failure of a single store operation. Any transaction it opened has
/// already been rolled back.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StorageError {
    message: String,
    #[source]
    source: sqlx::Error,
}

impl StorageError {
    pub fn new(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self {
            message: message.into(),
            source,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why an ingestion invocation failed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to update refresh token for user {user_id}")]
    Credential {
        user_id: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to ingest top {category} items for {time_range}")]
    Snapshot {
        category: Category,
        time_range: TimeRange,
        #[source]
        source: StorageError,
    },
}
