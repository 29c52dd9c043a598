//! Tests for cache index initialization

use tempfile::TempDir;
use tphoto_common::db::{init_cache_index, IndexLocation};

#[tokio::test]
async fn test_index_file_created_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("index.db");

    let result = init_cache_index(&IndexLocation::File(db_path.clone())).await;

    assert!(result.is_ok(), "Index initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Index file was not created");
}

#[tokio::test]
async fn test_index_opens_existing_and_keeps_rows() {
    let temp_dir = TempDir::new().unwrap();
    let location = IndexLocation::File(temp_dir.path().join("index.db"));

    let pool = init_cache_index(&location).await.unwrap();
    sqlx::query(
        "INSERT INTO video_cache (key, video_path, size_bytes, checksum, created_at, last_accessed_at)
         VALUES ('k1', '/tmp/k1.mp4', 10, 'abc', 1, 1)",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    // Re-initializing must not drop existing data
    let pool = init_cache_index(&location).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_in_memory_index_is_shared_across_queries() {
    let pool = init_cache_index(&IndexLocation::InMemory).await.unwrap();

    sqlx::query(
        "INSERT INTO video_cache (key, video_path, size_bytes, checksum, created_at, last_accessed_at)
         VALUES ('k1', '/tmp/k1.mp4', 10, 'abc', 1, 1)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_negative_size_rejected() {
    let pool = init_cache_index(&IndexLocation::InMemory).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO video_cache (key, video_path, size_bytes, checksum, created_at, last_accessed_at)
         VALUES ('k1', '/tmp/k1.mp4', -1, 'abc', 1, 1)",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_video_meta_table_created() {
    let pool = init_cache_index(&IndexLocation::InMemory).await.unwrap();

    sqlx::query(
        "INSERT INTO video_meta (key, lip_x, lip_y, lip_width, lip_height, duration_ms)
         VALUES ('k1', 0.4, 0.5, 0.2, 0.15, NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let width: f64 = sqlx::query_scalar("SELECT lip_width FROM video_meta WHERE key = 'k1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!((width - 0.2).abs() < 1e-9);
}
