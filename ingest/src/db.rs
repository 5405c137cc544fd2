use anyhow::Result;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Transaction};

use crate::config::DatabaseSettings;
use crate::error::StorageError;
use crate::models::*;
use crate::store::SnapshotStore;

const SELECT_TOP_ARTISTS: &str = r#"
    SELECT artist_id AS item_id, position, position_change, is_new
    FROM top_artist
    WHERE spotify_user_id = $1
      AND time_range = $2
      AND collected_date = $3
    ORDER BY position ASC
"#;

const SELECT_TOP_TRACKS: &str = r#"
    SELECT track_id AS item_id, position, position_change, is_new
    FROM top_track
    WHERE spotify_user_id = $1
      AND time_range = $2
      AND collected_date = $3
    ORDER BY position ASC
"#;

const INSERT_TOP_ARTIST: &str = r#"
    INSERT INTO top_artist (
        spotify_user_id, artist_id, collected_date, time_range,
        position, position_change, is_new
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

const INSERT_TOP_TRACK: &str = r#"
    INSERT INTO top_track (
        spotify_user_id, track_id, collected_date, time_range,
        position, position_change, is_new
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

const INSERT_TOP_GENRE: &str = r#"
    INSERT INTO top_genre (
        spotify_user_id, genre_name, collected_date, time_range, count
    ) VALUES ($1, $2, $3, $4, $5)
"#;

const INSERT_TOP_EMOTION: &str = r#"
    INSERT INTO top_emotion (
        spotify_user_id, emotion_name, track_id, collected_date, time_range, percentage
    ) VALUES ($1, $2, $3, $4, $5, $6)
"#;

const UPDATE_REFRESH_TOKEN: &str = r#"
    UPDATE spotify_user
    SET refresh_token = $1, updated_at = NOW()
    WHERE id = $2
"#;

pub async fn init_db(settings: &DatabaseSettings) -> Result<PgPool> {
    let options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .database(&settings.name)
        .username(&settings.user)
        .password(&settings.password);

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed [`SnapshotStore`] holding one pooled connection.
///
/// The connection goes back to the pool when the store is dropped, and an
/// unfinished transaction is rolled back at the latest by then.
pub struct PgSnapshotStore {
    conn: PoolConnection<Postgres>,
}

impl PgSnapshotStore {
    pub async fn acquire(pool: &PgPool) -> Result<Self, StorageError> {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| storage_error("Failed to acquire database connection", e))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get_previous(&mut self, key: &SnapshotKey) -> Result<PreviousSnapshot, StorageError> {
        let statement = match key.category {
            Category::Artist => SELECT_TOP_ARTISTS,
            Category::Track => SELECT_TOP_TRACKS,
            Category::Genre | Category::Emotion => return Ok(PreviousSnapshot::Empty),
        };

        let rows = sqlx::query_as::<_, RankedRow>(statement)
            .bind(&key.user_id)
            .bind(key.time_range.as_str())
            .bind(key.collected_date)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| {
                storage_error(
                    format!(
                        "Failed to get top {}s. User ID: {}, time range: {}",
                        key.category, key.user_id, key.time_range
                    ),
                    e,
                )
            })?;

        Ok(rows
            .into_iter()
            .map(RankedItem::from)
            .collect::<Vec<_>>()
            .into())
    }

    async fn store(&mut self, key: &SnapshotKey, items: &TopItems) -> Result<(), StorageError> {
        debug_assert_eq!(key.category, items.category());

        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        if let Err(e) = insert_items(&mut tx, key, items).await {
            rollback(tx).await;
            return Err(storage_error(
                format!("Failed to store top {}s", key.category),
                e,
            ));
        }

        tx.commit()
            .await
            .map_err(|e| storage_error(format!("Failed to commit top {}s", key.category), e))?;

        tracing::debug!(
            "stored {} top {}s for user {} ({}, {})",
            items.len(),
            key.category,
            key.user_id,
            key.time_range,
            key.collected_date
        );

        Ok(())
    }

    async fn update_credential(
        &mut self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        let updated = sqlx::query(UPDATE_REFRESH_TOKEN)
            .bind(refresh_token)
            .bind(user_id)
            .execute(&mut *tx)
            .await;

        let updated = match updated {
            Ok(result) => result.rows_affected(),
            Err(e) => {
                rollback(tx).await;
                return Err(storage_error("Failed to update user's refresh token", e));
            }
        };

        tx.commit()
            .await
            .map_err(|e| storage_error("Failed to commit user's refresh token", e))?;

        if updated == 0 {
            tracing::warn!("no spotify user {} to update the refresh token of", user_id);
        }

        Ok(())
    }
}

async fn insert_items(
    conn: &mut PgConnection,
    key: &SnapshotKey,
    items: &TopItems,
) -> Result<(), sqlx::Error> {
    match items {
        TopItems::Artists(artists) => insert_ranked(conn, INSERT_TOP_ARTIST, key, artists).await,
        TopItems::Tracks(tracks) => insert_ranked(conn, INSERT_TOP_TRACK, key, tracks).await,
        TopItems::Genres(genres) => {
            for genre in genres {
                sqlx::query(INSERT_TOP_GENRE)
                    .bind(&key.user_id)
                    .bind(&genre.name)
                    .bind(key.collected_date)
                    .bind(key.time_range.as_str())
                    .bind(genre.count)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        TopItems::Emotions(emotions) => {
            for emotion in emotions {
                sqlx::query(INSERT_TOP_EMOTION)
                    .bind(&key.user_id)
                    .bind(&emotion.name)
                    .bind(&emotion.track_id)
                    .bind(key.collected_date)
                    .bind(key.time_range.as_str())
                    .bind(emotion.percentage)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
    }
}

async fn insert_ranked(
    conn: &mut PgConnection,
    statement: &'static str,
    key: &SnapshotKey,
    items: &[RankedItem],
) -> Result<(), sqlx::Error> {
    for item in items {
        sqlx::query(statement)
            .bind(&key.user_id)
            .bind(&item.id)
            .bind(key.collected_date)
            .bind(key.time_range.as_str())
            .bind(item.position)
            .bind(item.position_change)
            .bind(item.is_new)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!("Failed to insert top {} {}: {}", key.category, item.id, e);
                e
            })?;
    }
    Ok(())
}

async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!("Failed to roll back transaction: {}", e);
    }
}

fn storage_error(message: impl Into<String>, source: sqlx::Error) -> StorageError {
    let message = message.into();
    tracing::error!("{} - {}", message, source);
    StorageError::new(message, source)
}
