//! Cache-first video provider with one in-flight fetch per key
//!
//! `fetch` checks the cache, and on a miss runs generate → poll → download →
//! store. Concurrent requests for the same key join the running flight
//! instead of issuing their own backend calls. A flight lives as long as at
//! least one waiter holds its ticket; when the last one drops, the flight is
//! dropped with it and nothing is cached.

use crate::cache::{CacheLease, VideoCache};
use crate::error::Error;
use crate::fetch::backend_client::BackendClient;
use crate::model::{CacheKey, TalkingPhotoRequest, VideoMeta};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Progress of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStage {
    /// Looking up the cache
    Checking,
    /// Cache miss; submitting the generation job
    Generating,
    /// Job submitted; waiting for completion and transferring the video
    Downloading,
}

/// Where a prepared video came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoOrigin {
    Cache,
    Backend,
}

/// Verified, cached video ready for playback
///
/// Holds a cache lease; the file stays pinned while any clone is alive.
#[derive(Debug, Clone)]
pub struct PreparedVideo {
    pub key: CacheKey,
    pub meta: VideoMeta,
    pub origin: VideoOrigin,
    lease: Arc<CacheLease>,
}

impl PreparedVideo {
    pub fn new(key: CacheKey, meta: VideoMeta, origin: VideoOrigin, lease: CacheLease) -> Self {
        Self {
            key,
            meta,
            origin,
            lease: Arc::new(lease),
        }
    }

    pub fn path(&self) -> &Path {
        self.lease.path()
    }
}

/// Outcome shared by every waiter of a flight
pub type FetchResult = std::result::Result<PreparedVideo, Arc<Error>>;

type FlightFuture = Shared<BoxFuture<'static, FetchResult>>;

/// Handle on a (possibly shared) fetch
pub struct FetchTicket {
    key: CacheKey,
    progress: watch::Receiver<FetchStage>,
    flight: FlightFuture,
}

impl FetchTicket {
    /// Wrap an arbitrary future as a ticket
    pub fn new(
        key: CacheKey,
        progress: watch::Receiver<FetchStage>,
        future: BoxFuture<'static, FetchResult>,
    ) -> Self {
        Self {
            key,
            progress,
            flight: future.shared(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Stage updates for this flight
    pub fn progress(&self) -> watch::Receiver<FetchStage> {
        self.progress.clone()
    }

    pub async fn wait(self) -> FetchResult {
        self.flight.await
    }
}

/// Source of playable videos
pub trait VideoSource: Send + Sync {
    fn fetch(&self, request: TalkingPhotoRequest) -> FetchTicket;
}

struct Flight {
    flight: WeakShared<BoxFuture<'static, FetchResult>>,
    progress: watch::Receiver<FetchStage>,
}

type FlightMap = Arc<Mutex<HashMap<CacheKey, Flight>>>;

/// De-duplicating cache + backend video provider
pub struct VideoProvider {
    cache: Arc<VideoCache>,
    client: Arc<BackendClient>,
    inflight: FlightMap,
}

impl VideoProvider {
    pub fn new(cache: Arc<VideoCache>, client: Arc<BackendClient>) -> Self {
        Self {
            cache,
            client,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<VideoCache> {
        &self.cache
    }

    /// Number of flights currently running
    pub fn inflight_count(&self) -> usize {
        let inflight = lock_map(&self.inflight);
        inflight
            .values()
            .filter(|f| f.flight.upgrade().is_some())
            .count()
    }

    /// Fetch and wait in one call
    pub async fn get(&self, request: TalkingPhotoRequest) -> FetchResult {
        self.fetch(request).wait().await
    }
}

impl VideoSource for VideoProvider {
    fn fetch(&self, request: TalkingPhotoRequest) -> FetchTicket {
        let key = request.cache_key();
        let mut inflight = lock_map(&self.inflight);

        if let Some(existing) = inflight.get(&key) {
            if let Some(flight) = existing.flight.upgrade() {
                debug!(key = %key, poster_id = %request.poster_id, "Joining in-flight fetch");
                return FetchTicket {
                    key,
                    progress: existing.progress.clone(),
                    flight,
                };
            }
        }

        // Entries whose waiters all went away
        inflight.retain(|_, f| f.flight.upgrade().is_some());

        let (progress_tx, progress_rx) = watch::channel(FetchStage::Checking);
        let cache = Arc::clone(&self.cache);
        let client = Arc::clone(&self.client);
        let map = Arc::clone(&self.inflight);
        let flight_key = key.clone();

        let future = async move {
            let result = run_fetch(cache, client, request, flight_key.clone(), progress_tx).await;
            lock_map(&map).remove(&flight_key);
            result
        }
        .boxed()
        .shared();

        if let Some(weak) = future.downgrade() {
            inflight.insert(
                key.clone(),
                Flight {
                    flight: weak,
                    progress: progress_rx.clone(),
                },
            );
        }

        FetchTicket {
            key,
            progress: progress_rx,
            flight: future,
        }
    }
}

fn lock_map(map: &FlightMap) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Flight>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_fetch(
    cache: Arc<VideoCache>,
    client: Arc<BackendClient>,
    request: TalkingPhotoRequest,
    key: CacheKey,
    progress: watch::Sender<FetchStage>,
) -> FetchResult {
    if let Some(lease) = cache.checkout(&key).await? {
        let meta = lease.entry().meta;
        match meta {
            Some(meta) => {
                info!(key = %key, poster_id = %request.poster_id, "Serving video from cache");
                return Ok(PreparedVideo::new(key, meta, VideoOrigin::Cache, lease));
            }
            None => {
                warn!(key = %key, "Cached video has no lip metadata, fetching again");
                drop(lease);
                cache.remove(&key).await?;
            }
        }
    }

    let _ = progress.send(FetchStage::Generating);
    let job = client.generate(&request).await?;

    let _ = progress.send(FetchStage::Downloading);
    let result = client.poll_until_complete(&job).await?;
    let video = client
        .download(&result.video_url, &result.checksum, result.size_bytes)
        .await?;

    cache
        .put_with_meta(&key, &video.bytes, &video.checksum, Some(&result.meta))
        .await?;
    drop(video);

    let lease = cache.checkout(&key).await?.ok_or_else(|| {
        Error::CacheCorruption(format!("entry {} unreadable right after write", key))
    })?;

    info!(
        key = %key,
        poster_id = %request.poster_id,
        job_id = %job.job_id,
        "Video generated and cached"
    );

    Ok(PreparedVideo::new(key, result.meta, VideoOrigin::Backend, lease))
}
