//! Cache index database initialization
//!
//! Creates the SQLite pool backing the video cache index and the
//! `video_cache` table (idempotent, safe to call on every start).

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::PathBuf;
use tracing::info;

/// Where the cache index lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    /// Process-local index, lost on exit (tests, ephemeral sessions)
    InMemory,
    /// SQLite database file
    File(PathBuf),
}

/// Open (creating if needed) the cache index database
pub async fn init_cache_index(location: &IndexLocation) -> Result<SqlitePool> {
    let pool = match location {
        IndexLocation::InMemory => {
            // A single long-lived connection; every new in-memory connection
            // would otherwise see its own empty database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        }
        IndexLocation::File(db_path) => {
            let newly_created = !db_path.exists();

            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
            let pool = SqlitePoolOptions::new()
                .max_connections(8)
                .min_connections(1)
                .connect(&db_url)
                .await?;

            if newly_created {
                info!("Initialized new cache index: {}", db_path.display());
            } else {
                info!("Opened existing cache index: {}", db_path.display());
            }

            // WAL allows concurrent readers with one writer
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;

            pool
        }
    };

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_video_cache_table(&pool).await?;
    create_video_meta_table(&pool).await?;

    Ok(pool)
}

/// One row per cached video; timestamps are Unix epoch milliseconds
async fn create_video_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS video_cache (
            key TEXT PRIMARY KEY,
            video_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
            checksum TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_accessed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_video_cache_last_accessed ON video_cache(last_accessed_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Playback metadata reported by the backend alongside each cached video
async fn create_video_meta_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS video_meta (
            key TEXT PRIMARY KEY,
            lip_x REAL NOT NULL,
            lip_y REAL NOT NULL,
            lip_width REAL NOT NULL,
            lip_height REAL NOT NULL,
            duration_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
