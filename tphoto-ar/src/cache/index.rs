//! Cache index queries
//!
//! One `video_cache` row per entry; timestamps are epoch milliseconds.

use crate::error::Result;
use crate::model::{CacheKey, LipCoordinates, VideoMeta};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;

/// Raw index row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub key: CacheKey,
    pub video_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at_ms: i64,
    pub last_accessed_at_ms: i64,
}

type RowTuple = (String, String, i64, String, i64, i64);

fn from_tuple(row: RowTuple) -> IndexRow {
    IndexRow {
        key: CacheKey::from_stored(row.0),
        video_path: PathBuf::from(row.1),
        size_bytes: row.2.max(0) as u64,
        checksum: row.3,
        created_at_ms: row.4,
        last_accessed_at_ms: row.5,
    }
}

const COLUMNS: &str = "key, video_path, size_bytes, checksum, created_at, last_accessed_at";

pub async fn get(db: &Pool<Sqlite>, key: &CacheKey) -> Result<Option<IndexRow>> {
    let row: Option<RowTuple> =
        sqlx::query_as(&format!("SELECT {} FROM video_cache WHERE key = ?", COLUMNS))
            .bind(key.as_str())
            .fetch_optional(db)
            .await?;
    Ok(row.map(from_tuple))
}

/// Insert or replace the row for `row.key`
pub async fn upsert(db: &Pool<Sqlite>, row: &IndexRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO video_cache (key, video_path, size_bytes, checksum, created_at, last_accessed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            video_path = excluded.video_path,
            size_bytes = excluded.size_bytes,
            checksum = excluded.checksum,
            created_at = excluded.created_at,
            last_accessed_at = excluded.last_accessed_at
        "#,
    )
    .bind(row.key.as_str())
    .bind(row.video_path.to_string_lossy().to_string())
    .bind(row.size_bytes as i64)
    .bind(&row.checksum)
    .bind(row.created_at_ms)
    .bind(row.last_accessed_at_ms)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn touch(db: &Pool<Sqlite>, key: &CacheKey, accessed_at_ms: i64) -> Result<()> {
    sqlx::query("UPDATE video_cache SET last_accessed_at = ? WHERE key = ?")
        .bind(accessed_at_ms)
        .bind(key.as_str())
        .execute(db)
        .await?;
    Ok(())
}

/// Delete the entry row and its metadata
pub async fn delete(db: &Pool<Sqlite>, key: &CacheKey) -> Result<bool> {
    sqlx::query("DELETE FROM video_meta WHERE key = ?")
        .bind(key.as_str())
        .execute(db)
        .await?;
    let result = sqlx::query("DELETE FROM video_cache WHERE key = ?")
        .bind(key.as_str())
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn total_size(db: &Pool<Sqlite>) -> Result<u64> {
    let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM video_cache")
        .fetch_one(db)
        .await?;
    Ok(total.max(0) as u64)
}

pub async fn count(db: &Pool<Sqlite>) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_cache")
        .fetch_one(db)
        .await?;
    Ok(count.max(0) as u64)
}

/// All rows, least recently accessed first
pub async fn lru_order(db: &Pool<Sqlite>) -> Result<Vec<IndexRow>> {
    let rows: Vec<RowTuple> = sqlx::query_as(&format!(
        "SELECT {} FROM video_cache ORDER BY last_accessed_at ASC, key ASC",
        COLUMNS
    ))
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_tuple).collect())
}

/// Rows created at or before `cutoff_ms`
pub async fn created_before(db: &Pool<Sqlite>, cutoff_ms: i64) -> Result<Vec<IndexRow>> {
    let rows: Vec<RowTuple> = sqlx::query_as(&format!(
        "SELECT {} FROM video_cache WHERE created_at <= ? ORDER BY created_at ASC",
        COLUMNS
    ))
    .bind(cutoff_ms)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(from_tuple).collect())
}

pub async fn upsert_meta(db: &Pool<Sqlite>, key: &CacheKey, meta: &VideoMeta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO video_meta (key, lip_x, lip_y, lip_width, lip_height, duration_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            lip_x = excluded.lip_x,
            lip_y = excluded.lip_y,
            lip_width = excluded.lip_width,
            lip_height = excluded.lip_height,
            duration_ms = excluded.duration_ms
        "#,
    )
    .bind(key.as_str())
    .bind(meta.lip.x() as f64)
    .bind(meta.lip.y() as f64)
    .bind(meta.lip.width() as f64)
    .bind(meta.lip.height() as f64)
    .bind(meta.duration_ms.map(|ms| ms as i64))
    .execute(db)
    .await?;
    Ok(())
}

/// Stored metadata; rows that no longer validate read as absent
pub async fn get_meta(db: &Pool<Sqlite>, key: &CacheKey) -> Result<Option<VideoMeta>> {
    let row: Option<(f64, f64, f64, f64, Option<i64>)> = sqlx::query_as(
        "SELECT lip_x, lip_y, lip_width, lip_height, duration_ms FROM video_meta WHERE key = ?",
    )
    .bind(key.as_str())
    .fetch_optional(db)
    .await?;

    Ok(row.and_then(|(x, y, width, height, duration_ms)| {
        LipCoordinates::new(x as f32, y as f32, width as f32, height as f32)
            .ok()
            .map(|lip| VideoMeta {
                lip,
                duration_ms: duration_ms.map(|ms| ms.max(0) as u64),
            })
    }))
}

/// Remove metadata rows whose entry is gone
pub async fn delete_dangling_meta(db: &Pool<Sqlite>) -> Result<u64> {
    let result =
        sqlx::query("DELETE FROM video_meta WHERE key NOT IN (SELECT key FROM video_cache)")
            .execute(db)
            .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tphoto_common::db::{init_cache_index, IndexLocation};

    fn row(key: &str, size: u64, accessed: i64) -> IndexRow {
        IndexRow {
            key: CacheKey::from_stored(key.to_string()),
            video_path: PathBuf::from(format!("/tmp/{}.mp4", key)),
            size_bytes: size,
            checksum: "00".to_string(),
            created_at_ms: 1,
            last_accessed_at_ms: accessed,
        }
    }

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let db = init_cache_index(&IndexLocation::InMemory).await.unwrap();
        let r = row("a", 10, 5);
        upsert(&db, &r).await.unwrap();

        assert_eq!(get(&db, &r.key).await.unwrap(), Some(r.clone()));

        let mut updated = r.clone();
        updated.size_bytes = 20;
        upsert(&db, &updated).await.unwrap();
        assert_eq!(get(&db, &r.key).await.unwrap().unwrap().size_bytes, 20);
        assert_eq!(count(&db).await.unwrap(), 1);

        assert!(delete(&db, &r.key).await.unwrap());
        assert!(!delete(&db, &r.key).await.unwrap());
        assert!(get(&db, &r.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_order_and_total() {
        let db = init_cache_index(&IndexLocation::InMemory).await.unwrap();
        upsert(&db, &row("new", 10, 300)).await.unwrap();
        upsert(&db, &row("old", 20, 100)).await.unwrap();
        upsert(&db, &row("mid", 30, 200)).await.unwrap();

        let keys: Vec<_> = lru_order(&db)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key.as_str().to_string())
            .collect();
        assert_eq!(keys, vec!["old", "mid", "new"]);
        assert_eq!(total_size(&db).await.unwrap(), 60);

        touch(&db, &CacheKey::from_stored("old".into()), 400).await.unwrap();
        let first = lru_order(&db).await.unwrap().remove(0);
        assert_eq!(first.key.as_str(), "mid");
    }

    #[tokio::test]
    async fn test_total_size_empty_is_zero() {
        let db = init_cache_index(&IndexLocation::InMemory).await.unwrap();
        assert_eq!(total_size(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_meta_round_trip_and_cascade() {
        let db = init_cache_index(&IndexLocation::InMemory).await.unwrap();
        let r = row("a", 10, 5);
        upsert(&db, &r).await.unwrap();

        let meta = VideoMeta {
            lip: LipCoordinates::new(0.4, 0.5, 0.2, 0.15).unwrap(),
            duration_ms: Some(5200),
        };
        upsert_meta(&db, &r.key, &meta).await.unwrap();
        assert_eq!(get_meta(&db, &r.key).await.unwrap(), Some(meta));

        delete(&db, &r.key).await.unwrap();
        assert!(get_meta(&db, &r.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_meta_removed() {
        let db = init_cache_index(&IndexLocation::InMemory).await.unwrap();
        let meta = VideoMeta {
            lip: LipCoordinates::new(0.1, 0.1, 0.2, 0.2).unwrap(),
            duration_ms: None,
        };
        upsert_meta(&db, &CacheKey::from_stored("ghost".into()), &meta)
            .await
            .unwrap();
        assert_eq!(delete_dangling_meta(&db).await.unwrap(), 1);
    }
}
