//! Error types for tphoto-ar
//!
//! Variants follow the failure taxonomy of the pipeline: detection, network,
//! generation, download, cache, format and storage failures, plus the
//! infrastructure errors they are built on.

use std::time::Duration;
use thiserror::Error;
use tphoto_common::events::{ErrorKind, ErrorReport};

/// Network stage that timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Poll,
    Download,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Generate => write!(f, "generate"),
            Stage::Poll => write!(f, "poll"),
            Stage::Download => write!(f, "download"),
        }
    }
}

/// Main error type for tphoto-ar
#[derive(Error, Debug)]
pub enum Error {
    /// No qualifying poster detected in time
    #[error("No poster detected within {0:?}")]
    PosterDetectionTimeout(Duration),

    /// Network failure, 5xx or 429 from the backend (retried)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend refused the request (4xx other than 429, not retried)
    #[error("Backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    /// A network stage exceeded its time budget
    #[error("Timed out during {stage} after {elapsed:?}")]
    Timeout { stage: Stage, elapsed: Duration },

    /// Backend reported the generation job as failed
    #[error("Video generation failed: {0}")]
    GenerationFailed(String),

    /// Checksum mismatch or truncated transfer
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Cached file no longer matches its checksum
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// Video or backend payload failed validation
    #[error("Invalid format: {0}")]
    FormatInvalid(String),

    /// Cache cannot evict enough space for an entry
    #[error("Storage full: need {needed} bytes, capacity {capacity} bytes")]
    StorageFull { needed: u64, capacity: u64 },

    /// Video decode errors
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Cache index errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using tphoto-ar Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<tphoto_common::Error> for Error {
    fn from(err: tphoto_common::Error) -> Self {
        match err {
            tphoto_common::Error::Database(e) => Error::Database(e),
            tphoto_common::Error::Io(e) => Error::Io(e),
            tphoto_common::Error::Config(msg) | tphoto_common::Error::InvalidInput(msg) => {
                Error::Config(msg)
            }
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures are all treated as transient
        Error::BackendUnavailable(err.to_string())
    }
}

impl Error {
    /// Category used at the UI boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PosterDetectionTimeout(_) => ErrorKind::PosterDetectionTimeout,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::BackendRejected { .. } => ErrorKind::BackendRejected,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Error::DownloadError(_) => ErrorKind::DownloadError,
            Error::CacheCorruption(_) => ErrorKind::CacheCorruption,
            Error::FormatInvalid(_) => ErrorKind::FormatInvalid,
            Error::StorageFull { .. } => ErrorKind::StorageFull,
            Error::Decode(_) => ErrorKind::Playback,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidState(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Retry budget applies to these; everything else is surfaced at once
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Structured, user-actionable report
    pub fn report(&self) -> ErrorReport {
        let message = match self {
            Error::PosterDetectionTimeout(_) => {
                "No talking poster found. Point the camera at a poster and rescan.".to_string()
            }
            Error::BackendUnavailable(_) | Error::Timeout { .. } => {
                "The video service is not reachable. Check your connection and rescan.".to_string()
            }
            Error::StorageFull { .. } => {
                "Not enough storage for this video. Free some space and rescan.".to_string()
            }
            Error::FormatInvalid(_) => {
                "The generated video could not be used. Try another poster.".to_string()
            }
            other => other.to_string(),
        };
        ErrorReport::new(self.kind(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::BackendUnavailable("503".into()).is_transient());
        assert!(Error::DownloadError("short read".into()).is_transient());
        assert!(Error::Timeout {
            stage: Stage::Generate,
            elapsed: Duration::from_secs(30)
        }
        .is_transient());

        assert!(!Error::GenerationFailed("bad voice".into()).is_transient());
        assert!(!Error::BackendRejected {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!Error::FormatInvalid("not a video".into()).is_transient());
    }

    #[test]
    fn test_report_kind_matches() {
        let err = Error::StorageFull {
            needed: 10,
            capacity: 5,
        };
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::StorageFull);
        assert!(!report.message.is_empty());
    }

    #[test]
    fn test_common_error_conversion() {
        let err: Error = tphoto_common::Error::Config("missing".into()).into();
        assert!(matches!(err, Error::Config(msg) if msg == "missing"));
    }
}
