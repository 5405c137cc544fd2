use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::{PreviousSnapshot, SnapshotKey, TopItems};

/// Persistence for snapshots and user credentials.
///
/// An implementation holds one connection for its whole lifetime; dropping it
/// releases that connection. Every failure is reported as a [`StorageError`]
/// after rolling back whatever transaction the operation had open.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send {
    /// Items stored under exactly `key`, ordered by position.
    ///
    /// No rows is [`PreviousSnapshot::Empty`], not an error. Lists of
    /// unranked categories are never compared and always come back empty.
    async fn get_previous(&mut self, key: &SnapshotKey) -> Result<PreviousSnapshot, StorageError>;

    /// Append one row per item under `key` in a single transaction.
    async fn store(&mut self, key: &SnapshotKey, items: &TopItems) -> Result<(), StorageError>;

    /// Overwrite the refresh token stored for `user_id`.
    async fn update_credential(
        &mut self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<(), StorageError>;
}
