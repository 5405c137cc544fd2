pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod rank_delta;
pub mod store;

pub use config::{ComparisonIntervals, Settings};
pub use db::PgSnapshotStore;
pub use error::{IngestError, StorageError};
pub use ingest::{ingest_snapshot, IngestSummary};
pub use models::{
    Category, PreviousSnapshot, RankedItem, SnapshotKey, SnapshotRequest, TimeRange, TopItems,
};
pub use store::SnapshotStore;
