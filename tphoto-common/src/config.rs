//! Configuration file model and root folder resolution
//!
//! Values are resolved in this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "TPHOTO_ROOT_FOLDER";

/// On-disk TOML configuration
///
/// Every section and key is optional; missing values fall back to the
/// component defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding the cache directory and index database
    pub root_folder: Option<PathBuf>,
    pub backend: BackendSection,
    pub cache: CacheSection,
    pub tracking: TrackingSection,
    pub render: RenderSection,
}

/// `[backend]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub base_url: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub chunk_timeout_ms: Option<u64>,
}

/// `[cache]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Cache directory; defaults to `<root_folder>/cache`
    pub dir: Option<PathBuf>,
    pub max_bytes: Option<u64>,
    pub ttl_secs: Option<u64>,
}

/// `[tracking]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackingSection {
    pub min_quality: Option<f32>,
    pub lost_timeout_ms: Option<u64>,
    pub detection_timeout_ms: Option<u64>,
}

/// `[render]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub feather_radius: Option<f32>,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))
    }

    /// Load configuration from an explicit path
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Load configuration from an explicit path, or the platform config file
    /// if one exists, or defaults otherwise
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_file() {
            Some(path) => {
                tracing::info!("Loading config file {}", path.display());
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Resolve the root folder following CLI → ENV → TOML → default priority
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Platform config file location, if present
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("tphoto").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/tphoto/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("tphoto"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tphoto"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("tphoto"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tphoto"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("tphoto"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\tphoto"))
    } else {
        PathBuf::from("./tphoto_data")
    }
}
