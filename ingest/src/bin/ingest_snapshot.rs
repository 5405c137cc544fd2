use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use snapshot_ingest::{db, ingest_snapshot, PgSnapshotStore, Settings, SnapshotRequest};
use sqlx::PgPool;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(name = "ingest-snapshot")]
#[command(about = "Ingest one top-items snapshot message", long_about = None)]
struct Cli {
    /// Queue event JSON to ingest, read from stdin when omitted
    #[arg(short, long, value_name = "PATH")]
    event: Option<PathBuf>,

    /// Record the snapshot under this date instead of today (UTC)
    #[arg(long, value_name = "YYYY-MM-DD")]
    collected_date: Option<NaiveDate>,

    /// Run database migrations before ingesting
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("ingest_snapshot=info,snapshot_ingest=info,envelope=info")
        .init();

    let cli = Cli::parse();

    let settings = Settings::from_env().context("Failed to load settings")?;
    tracing::debug!("loaded settings: {:?}", settings);

    let raw = read_event(cli.event.as_deref()).await?;
    let data = envelope::decode_event(&raw).context("Failed to decode event")?;
    let request = SnapshotRequest::from(data);
    tracing::info!(
        "received {} top item lists for user {}",
        request.windows.len(),
        request.user_id
    );

    let pool = db::init_db(&settings.database)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database connection established.");

    let collected_date = cli
        .collected_date
        .unwrap_or_else(|| Utc::now().date_naive());

    let result = close_after(&pool, async {
        if cli.migrate {
            db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("migrations applied");
        }

        let store = PgSnapshotStore::acquire(&pool).await?;
        let summary = ingest_snapshot(
            store,
            &request,
            &settings.comparison_intervals,
            collected_date,
        )
        .await?;
        Ok(summary)
    })
    .await;

    match result {
        Ok(summary) => {
            tracing::info!(
                "ingested {} rows across {} lists for user {} on {} (refresh token updated: {})",
                summary.rows_stored,
                summary.windows_stored,
                request.user_id,
                collected_date,
                summary.credential_updated
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("ingestion failed for user {}: {:#}", request.user_id, e);
            Err(e.context(format!("Failed to ingest snapshot for user {}", request.user_id)))
        }
    }
}

async fn read_event(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read event from {}", path.display())),
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("Failed to read event from stdin")?;
            Ok(raw)
        }
    }
}

/// Run `work` against the pool, then close the pool whatever the outcome.
async fn close_after<T, F>(pool: &PgPool, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = work.await;
    pool.close().await;
    result
}
