//! One ingestion invocation: refresh token first, then every list in the
//! order it was received.
//!
//! Steps run strictly one after another. The first failure ends the
//! invocation; lists stored before it stay committed, the rest are not
//! attempted. Nothing is retried here, that is up to whoever redelivers the
//! message.

use chrono::NaiveDate;

use crate::config::ComparisonIntervals;
use crate::error::{IngestError, StorageError};
use crate::models::{PreviousSnapshot, SnapshotKey, SnapshotRequest, TopItems};
use crate::rank_delta::{compute_deltas, mark_all_new};
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub credential_updated: bool,
    pub windows_stored: usize,
    pub rows_stored: usize,
}

/// Persist `request` under `collected_date`.
///
/// The store is consumed so its connection is released once this returns,
/// whichever way it returns.
pub async fn ingest_snapshot<S: SnapshotStore>(
    mut store: S,
    request: &SnapshotRequest,
    intervals: &ComparisonIntervals,
    collected_date: NaiveDate,
) -> Result<IngestSummary, IngestError> {
    let mut summary = IngestSummary::default();

    match &request.refresh_token {
        Some(refresh_token) => {
            store
                .update_credential(&request.user_id, refresh_token)
                .await
                .map_err(|source| IngestError::Credential {
                    user_id: request.user_id.clone(),
                    source,
                })?;
            summary.credential_updated = true;
            tracing::info!("updated refresh token for user {}", request.user_id);
        }
        None => {
            tracing::debug!("no refresh token for user {}, skipping update", request.user_id);
        }
    }

    for window in &request.windows {
        let category = window.items.category();

        if window.items.is_empty() {
            tracing::debug!(
                "no top {}s for {} in message, nothing to store",
                category,
                window.time_range
            );
            continue;
        }

        let key = SnapshotKey::new(&request.user_id, category, window.time_range, collected_date);
        let snapshot_error = |source| IngestError::Snapshot {
            category,
            time_range: window.time_range,
            source,
        };

        let items = with_rank_changes(&mut store, &key, &window.items, intervals)
            .await
            .map_err(snapshot_error)?;
        store.store(&key, &items).await.map_err(snapshot_error)?;

        summary.windows_stored += 1;
        summary.rows_stored += items.len();
        tracing::info!(
            "stored {} top {}s for user {} ({})",
            items.len(),
            category,
            request.user_id,
            window.time_range
        );
    }

    Ok(summary)
}

/// Fill in rank changes for ranked lists; other lists pass through as they are.
async fn with_rank_changes<S: SnapshotStore>(
    store: &mut S,
    key: &SnapshotKey,
    items: &TopItems,
    intervals: &ComparisonIntervals,
) -> Result<TopItems, StorageError> {
    let Some(current) = items.ranked() else {
        return Ok(items.clone());
    };

    let Some(previous_date) = intervals.previous_date(key.collected_date, key.time_range) else {
        tracing::debug!(
            "comparison date for top {}s falls before the calendar start, every item is new",
            key.category
        );
        return Ok(items.with_ranked(mark_all_new(current)));
    };
    let previous_key = key.on(previous_date);

    let enriched = match store.get_previous(&previous_key).await? {
        PreviousSnapshot::Found(previous) => {
            tracing::debug!(
                "comparing {} top {}s against {} from {}",
                current.len(),
                key.category,
                previous.len(),
                previous_key.collected_date
            );
            compute_deltas(current, &previous)
        }
        PreviousSnapshot::Empty => {
            tracing::debug!(
                "no top {}s stored on {}, every item is new",
                key.category,
                previous_key.collected_date
            );
            mark_all_new(current)
        }
    };

    Ok(items.with_ranked(enriched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, EmotionShare, GenreCount, RankedItem, TimeRange, TopItemsWindow};
    use crate::store::MockSnapshotStore;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn failure(message: &str) -> StorageError {
        StorageError::new(message, sqlx::Error::PoolClosed)
    }

    fn ranked(entries: &[(&str, i32)]) -> Vec<RankedItem> {
        entries
            .iter()
            .map(|(id, position)| RankedItem::new(*id, *position))
            .collect()
    }

    fn request(refresh_token: Option<&str>, windows: Vec<TopItemsWindow>) -> SnapshotRequest {
        SnapshotRequest {
            user_id: "1".to_string(),
            refresh_token: refresh_token.map(String::from),
            windows,
        }
    }

    fn window(time_range: TimeRange, items: TopItems) -> TopItemsWindow {
        TopItemsWindow { time_range, items }
    }

    /// Counts how many times the wrapped store is released.
    struct ReleaseCounting<S> {
        inner: S,
        releases: Arc<AtomicUsize>,
    }

    impl<S> Drop for ReleaseCounting<S> {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl<S: SnapshotStore> SnapshotStore for ReleaseCounting<S> {
        async fn get_previous(
            &mut self,
            key: &SnapshotKey,
        ) -> Result<PreviousSnapshot, StorageError> {
            self.inner.get_previous(key).await
        }

        async fn store(&mut self, key: &SnapshotKey, items: &TopItems) -> Result<(), StorageError> {
            self.inner.store(key, items).await
        }

        async fn update_credential(
            &mut self,
            user_id: &str,
            refresh_token: &str,
        ) -> Result<(), StorageError> {
            self.inner.update_credential(user_id, refresh_token).await
        }
    }

    #[tokio::test]
    async fn updates_credential_when_token_present() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_update_credential()
            .with(eq("1"), eq("refresh"))
            .times(1)
            .returning(|_, _| Ok(()));

        let summary = ingest_snapshot(
            store,
            &request(Some("refresh"), vec![]),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert!(summary.credential_updated);
        assert_eq!(summary.windows_stored, 0);
    }

    #[tokio::test]
    async fn skips_credential_when_token_absent() {
        let mut store = MockSnapshotStore::new();
        store.expect_update_credential().never();
        store
            .expect_store()
            .times(1)
            .returning(|_, _| Ok(()));

        let genres = TopItems::Genres(vec![GenreCount {
            name: "jazz".to_string(),
            count: 2,
        }]);
        let summary = ingest_snapshot(
            store,
            &request(None, vec![window(TimeRange::ShortTerm, genres)]),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert!(!summary.credential_updated);
        assert_eq!(summary.rows_stored, 1);
    }

    #[tokio::test]
    async fn credential_failure_prevents_any_snapshot_work() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_update_credential()
            .times(1)
            .returning(|_, _| Err(failure("Failed to update user's refresh token")));
        store.expect_get_previous().never();
        store.expect_store().never();

        let err = ingest_snapshot(
            store,
            &request(
                Some("refresh"),
                vec![window(TimeRange::ShortTerm, TopItems::Artists(ranked(&[("a", 1)])))],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Credential { ref user_id, .. } if user_id == "1"));
    }

    #[tokio::test]
    async fn stores_rank_changes_against_previous_snapshot() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_get_previous()
            .withf(|key| {
                key.category == Category::Artist
                    && key.time_range == TimeRange::ShortTerm
                    && key.collected_date == NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
            })
            .times(1)
            .returning(|_| {
                Ok(PreviousSnapshot::Found(ranked(&[("1", 3), ("2", 2), ("4", 3)])))
            });
        store
            .expect_store()
            .withf(|key, items| {
                let expected = TopItems::Artists(vec![
                    RankedItem {
                        id: "1".to_string(),
                        position: 1,
                        position_change: Some(2),
                        is_new: false,
                    },
                    RankedItem {
                        id: "2".to_string(),
                        position: 2,
                        position_change: Some(0),
                        is_new: false,
                    },
                    RankedItem::new("3", 3),
                ]);
                key.collected_date == today() && *items == expected
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let summary = ingest_snapshot(
            store,
            &request(
                None,
                vec![window(
                    TimeRange::ShortTerm,
                    TopItems::Artists(ranked(&[("1", 1), ("2", 2), ("3", 3)])),
                )],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert_eq!(summary.windows_stored, 1);
        assert_eq!(summary.rows_stored, 3);
    }

    #[tokio::test]
    async fn no_history_stores_every_item_as_new() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_get_previous()
            .times(1)
            .returning(|_| Ok(PreviousSnapshot::Empty));
        store
            .expect_store()
            .withf(|_, items| {
                *items == TopItems::Tracks(vec![RankedItem::new("t1", 1), RankedItem::new("t2", 2)])
            })
            .times(1)
            .returning(|_, _| Ok(()));

        ingest_snapshot(
            store,
            &request(
                None,
                vec![window(
                    TimeRange::MediumTerm,
                    TopItems::Tracks(ranked(&[("t1", 1), ("t2", 2)])),
                )],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn previous_date_uses_the_window_interval() {
        let intervals = ComparisonIntervals {
            short_term: 1,
            medium_term: 1,
            long_term: 7,
        };

        let mut store = MockSnapshotStore::new();
        store
            .expect_get_previous()
            .withf(|key| key.collected_date == NaiveDate::from_ymd_opt(2024, 12, 25).unwrap())
            .times(1)
            .returning(|_| Ok(PreviousSnapshot::Empty));
        store.expect_store().times(1).returning(|_, _| Ok(()));

        ingest_snapshot(
            store,
            &request(
                None,
                vec![window(TimeRange::LongTerm, TopItems::Artists(ranked(&[("a", 1)])))],
            ),
            &intervals,
            today(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn out_of_range_interval_marks_items_new_without_lookup() {
        let intervals = ComparisonIntervals {
            short_term: u32::MAX,
            medium_term: 1,
            long_term: 1,
        };

        let mut store = MockSnapshotStore::new();
        store.expect_get_previous().never();
        store
            .expect_store()
            .withf(|_, items| {
                items.ranked().is_some_and(|ranked| {
                    ranked
                        .iter()
                        .all(|i| i.is_new && i.position_change.is_none())
                })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let summary = ingest_snapshot(
            store,
            &request(
                None,
                vec![window(
                    TimeRange::ShortTerm,
                    TopItems::Tracks(ranked(&[("a", 1), ("b", 2)])),
                )],
            ),
            &intervals,
            NaiveDate::MIN,
        )
        .await
        .unwrap();
        assert_eq!(summary.windows_stored, 1);
    }

    #[tokio::test]
    async fn windows_are_processed_in_receipt_order_with_one_date() {
        let mut seq = Sequence::new();
        let mut store = MockSnapshotStore::new();

        store
            .expect_update_credential()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_get_previous()
            .withf(|key| key.category == Category::Artist)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(PreviousSnapshot::Empty));
        store
            .expect_store()
            .withf(|key, _| key.category == Category::Artist && key.collected_date == today())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_get_previous()
            .withf(|key| key.category == Category::Track)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(PreviousSnapshot::Empty));
        store
            .expect_store()
            .withf(|key, _| key.category == Category::Track && key.collected_date == today())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_store()
            .withf(|key, _| key.category == Category::Genre && key.collected_date == today())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_store()
            .withf(|key, _| key.category == Category::Emotion && key.collected_date == today())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let windows = vec![
            window(TimeRange::ShortTerm, TopItems::Artists(ranked(&[("a", 1)]))),
            window(TimeRange::ShortTerm, TopItems::Tracks(ranked(&[("t", 1)]))),
            window(
                TimeRange::ShortTerm,
                TopItems::Genres(vec![GenreCount {
                    name: "jazz".to_string(),
                    count: 3,
                }]),
            ),
            window(
                TimeRange::ShortTerm,
                TopItems::Emotions(vec![EmotionShare {
                    name: "calm".to_string(),
                    percentage: 0.4,
                    track_id: Some("t".to_string()),
                }]),
            ),
        ];

        let summary = ingest_snapshot(
            store,
            &request(Some("refresh"), windows),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            IngestSummary {
                credential_updated: true,
                windows_stored: 4,
                rows_stored: 4,
            }
        );
    }

    #[tokio::test]
    async fn store_failure_stops_remaining_windows() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_get_previous()
            .withf(|key| key.category == Category::Artist)
            .times(1)
            .returning(|_| Ok(PreviousSnapshot::Empty));
        store
            .expect_store()
            .withf(|key, _| key.category == Category::Artist)
            .times(1)
            .returning(|_, _| Err(failure("Failed to store top artists")));

        let windows = vec![
            window(TimeRange::ShortTerm, TopItems::Artists(ranked(&[("a", 1)]))),
            window(TimeRange::ShortTerm, TopItems::Tracks(ranked(&[("t", 1)]))),
        ];

        let err = ingest_snapshot(
            store,
            &request(None, windows),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap_err();

        match err {
            IngestError::Snapshot {
                category,
                time_range,
                source,
            } => {
                assert_eq!(category, Category::Artist);
                assert_eq!(time_range, TimeRange::ShortTerm);
                assert_eq!(source.message(), "Failed to store top artists");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn lookup_failure_is_not_treated_as_missing_history() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_get_previous()
            .times(1)
            .returning(|_| Err(failure("Failed to get top artists")));
        store.expect_store().never();

        let err = ingest_snapshot(
            store,
            &request(
                None,
                vec![window(TimeRange::ShortTerm, TopItems::Artists(ranked(&[("a", 1)])))],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Snapshot { category: Category::Artist, .. }));
    }

    #[tokio::test]
    async fn empty_lists_are_skipped() {
        let mut store = MockSnapshotStore::new();
        store.expect_get_previous().never();
        store.expect_store().never();

        let summary = ingest_snapshot(
            store,
            &request(
                None,
                vec![
                    window(TimeRange::ShortTerm, TopItems::Artists(vec![])),
                    window(TimeRange::LongTerm, TopItems::Genres(vec![])),
                ],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert_eq!(summary, IngestSummary::default());
    }

    #[tokio::test]
    async fn store_is_released_once_on_success() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut inner = MockSnapshotStore::new();
        inner
            .expect_update_credential()
            .returning(|_, _| Ok(()));

        let store = ReleaseCounting {
            inner,
            releases: releases.clone(),
        };
        ingest_snapshot(
            store,
            &request(Some("refresh"), vec![]),
            &ComparisonIntervals::default(),
            today(),
        )
        .await
        .unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_is_released_once_on_failure() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut inner = MockSnapshotStore::new();
        inner
            .expect_get_previous()
            .returning(|_| Ok(PreviousSnapshot::Empty));
        inner
            .expect_store()
            .returning(|_, _| Err(failure("Failed to store top tracks")));

        let store = ReleaseCounting {
            inner,
            releases: releases.clone(),
        };
        let result = ingest_snapshot(
            store,
            &request(
                None,
                vec![window(TimeRange::ShortTerm, TopItems::Tracks(ranked(&[("t", 1)])))],
            ),
            &ComparisonIntervals::default(),
            today(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
