//! Video cache: SQLite index, per-key locking and the on-disk store

pub mod index;
pub mod keyed_lock;
pub mod video_cache;

pub use keyed_lock::KeyedLocks;
pub use video_cache::{
    CacheConfig, CacheLease, CacheStats, CachedVideoEntry, VideoCache, DEFAULT_MAX_BYTES,
    DEFAULT_TTL,
};
