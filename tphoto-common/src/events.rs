//! UI boundary event types
//!
//! The controller publishes these over an observable state stream and an
//! event broadcast; the HTTP control surface serializes them for SSE.

use serde::{Deserialize, Serialize};

/// Talking-photo controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TalkingPhotoState {
    /// Waiting for a poster to be detected
    Idle,
    /// Poster detected, consulting the cache
    FetchingVideo,
    /// Cache miss, generation request in flight
    Generating,
    /// Job submitted, polling and downloading
    Downloading,
    /// Verified video available, not yet playing
    Ready,
    /// Overlay being rendered
    Playing,
    /// Playback suspended (tracking lost or user pause)
    Paused,
    /// Terminal failure for the current poster
    Error,
}

impl std::fmt::Display for TalkingPhotoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TalkingPhotoState::Idle => "idle",
            TalkingPhotoState::FetchingVideo => "fetching_video",
            TalkingPhotoState::Generating => "generating",
            TalkingPhotoState::Downloading => "downloading",
            TalkingPhotoState::Ready => "ready",
            TalkingPhotoState::Playing => "playing",
            TalkingPhotoState::Paused => "paused",
            TalkingPhotoState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Error category exposed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PosterDetectionTimeout,
    BackendUnavailable,
    BackendRejected,
    Timeout,
    GenerationFailed,
    DownloadError,
    CacheCorruption,
    FormatInvalid,
    StorageFull,
    Playback,
    Config,
    Internal,
}

impl ErrorKind {
    /// Whether the failure is worth retrying without a new request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::BackendUnavailable | ErrorKind::Timeout | ErrorKind::DownloadError
        )
    }
}

/// Structured, user-actionable error value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Latest observable controller state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: TalkingPhotoState,
    /// Active poster, if any
    pub poster_id: Option<String>,
    /// Current or saved playback position
    pub position_ms: u64,
    /// Set while `state == Error`
    pub error: Option<ErrorReport>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: TalkingPhotoState::Idle,
            poster_id: None,
            position_ms: 0,
            error: None,
        }
    }
}

/// Controller events broadcast to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerEvent {
    /// State machine transition
    StateChanged {
        old_state: TalkingPhotoState,
        new_state: TalkingPhotoState,
        poster_id: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A terminal error moved the controller to `Error`
    ErrorRaised {
        error: ErrorReport,
        poster_id: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback suspended; position saved for resume
    PlaybackPaused {
        poster_id: String,
        position_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback (re)started from a position
    PlaybackResumed {
        poster_id: String,
        position_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ControllerEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ControllerEvent::StateChanged { .. } => "StateChanged",
            ControllerEvent::ErrorRaised { .. } => "ErrorRaised",
            ControllerEvent::PlaybackPaused { .. } => "PlaybackPaused",
            ControllerEvent::PlaybackResumed { .. } => "PlaybackResumed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&TalkingPhotoState::FetchingVideo).unwrap();
        assert_eq!(json, "\"fetching_video\"");
        assert_eq!(TalkingPhotoState::FetchingVideo.to_string(), "fetching_video");
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::BackendUnavailable.is_transient());
        assert!(ErrorKind::DownloadError.is_transient());
        assert!(!ErrorKind::GenerationFailed.is_transient());
        assert!(!ErrorKind::FormatInvalid.is_transient());
        assert!(!ErrorKind::StorageFull.is_transient());
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = ControllerEvent::PlaybackPaused {
            poster_id: "P1".to_string(),
            position_ms: 3200,
            timestamp: chrono::Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "PlaybackPaused");
        assert_eq!(value["position_ms"], 3200);
        assert_eq!(event.event_type(), "PlaybackPaused");
    }

    #[test]
    fn test_error_report_kind_serialization() {
        let report = ErrorReport::new(ErrorKind::StorageFull, "cache full");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["kind"], "STORAGE_FULL");
        assert_eq!(value["message"], "cache full");
    }
}
