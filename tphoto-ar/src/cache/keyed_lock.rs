//! Per-key async mutexes
//!
//! Serializes cache operations on one key while unrelated keys proceed
//! concurrently. Idle entries are pruned opportunistically.

use crate::model::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard held for the duration of a keyed operation
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks.len() > 64 {
            // Nobody else holds or waits on these
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        self.slot(key).lock_owned().await
    }

    /// Exclusive access to `key` only if immediately available
    pub fn try_lock(&self, key: &CacheKey) -> Option<KeyGuard> {
        self.slot(key).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from_stored(s.to_string())
    }

    #[tokio::test]
    async fn test_same_key_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(&key("a")).await;
        assert!(locks.try_lock(&key("a")).is_none());
        drop(guard);
        assert!(locks.try_lock(&key("a")).is_some());
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&key("a")).await;
        assert!(locks.try_lock(&key("b")).is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&key("held")).await;
        for i in 0..100 {
            let _ = locks.try_lock(&key(&format!("k{}", i)));
        }
        assert!(locks.try_lock(&key("held")).is_none());
        drop(held);
    }
}
