//! tphoto-ar settings
//!
//! Maps the shared TOML file model onto the per-component config structs.
//! Missing keys keep the component defaults.

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::fetch::{FetcherConfig, RetryPolicy};
use crate::render::RenderConfig;
use crate::tracking::TrackerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tphoto_common::config::TomlConfig;

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct Settings {
    pub root_folder: PathBuf,
    pub tracker: TrackerConfig,
    pub cache: CacheConfig,
    pub fetcher: FetcherConfig,
    pub render: RenderConfig,
}

impl Settings {
    /// Defaults rooted at `root_folder`
    pub fn with_root(root_folder: &Path) -> Self {
        Self {
            root_folder: root_folder.to_path_buf(),
            tracker: TrackerConfig::default(),
            cache: CacheConfig::new(root_folder.join("cache")),
            fetcher: FetcherConfig::default(),
            render: RenderConfig::default(),
        }
    }

    /// Apply a parsed config file on top of the defaults
    pub fn from_toml(toml: &TomlConfig, root_folder: &Path) -> Result<Self> {
        let mut settings = Self::with_root(root_folder);

        let backend = &toml.backend;
        if let Some(url) = &backend.base_url {
            settings.fetcher.base_url = url.clone();
        }
        if let Some(ms) = backend.request_timeout_ms {
            settings.fetcher.request_timeout = positive_ms("backend.request_timeout_ms", ms)?;
        }
        if let Some(ms) = backend.poll_interval_ms {
            settings.fetcher.poll_interval = positive_ms("backend.poll_interval_ms", ms)?;
        }
        if let Some(ms) = backend.poll_timeout_ms {
            settings.fetcher.poll_timeout = positive_ms("backend.poll_timeout_ms", ms)?;
        }
        if let Some(ms) = backend.chunk_timeout_ms {
            settings.fetcher.chunk_timeout = positive_ms("backend.chunk_timeout_ms", ms)?;
        }
        settings.fetcher.retry = RetryPolicy {
            max_retries: backend
                .max_retries
                .unwrap_or(settings.fetcher.retry.max_retries),
            initial_backoff: backend
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(settings.fetcher.retry.initial_backoff),
        };

        if let Some(dir) = &toml.cache.dir {
            let index_in_default_place = CacheConfig::new(dir.clone()).index;
            settings.cache.dir = dir.clone();
            settings.cache.index = index_in_default_place;
        }
        if let Some(max_bytes) = toml.cache.max_bytes {
            if max_bytes == 0 {
                return Err(Error::Config("cache.max_bytes must be positive".to_string()));
            }
            settings.cache.max_bytes = max_bytes;
        }
        if let Some(secs) = toml.cache.ttl_secs {
            if secs == 0 {
                return Err(Error::Config("cache.ttl_secs must be positive".to_string()));
            }
            settings.cache.ttl = Duration::from_secs(secs);
        }

        let tracking = &toml.tracking;
        if let Some(quality) = tracking.min_quality {
            if !(0.0..=1.0).contains(&quality) {
                return Err(Error::Config(format!(
                    "tracking.min_quality must be within [0, 1], got {}",
                    quality
                )));
            }
            settings.tracker.min_quality = quality;
        }
        if let Some(ms) = tracking.lost_timeout_ms {
            settings.tracker.lost_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = tracking.detection_timeout_ms {
            // 0 disables the detection timeout
            settings.tracker.detection_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(radius) = toml.render.feather_radius {
            if !radius.is_finite() || !(0.0..=0.5).contains(&radius) {
                return Err(Error::Config(format!(
                    "render.feather_radius must be within [0, 0.5], got {}",
                    radius
                )));
            }
            settings.render.feather_radius = radius;
        }

        Ok(settings)
    }
}

fn positive_ms(name: &str, ms: u64) -> Result<Duration> {
    if ms == 0 {
        return Err(Error::Config(format!("{} must be positive", name)));
    }
    Ok(Duration::from_millis(ms))
}
