//! Controller transition table
//!
//! Every state change goes through `next_state`; a trigger that has no entry
//! for the current state is rejected and leaves the state untouched.

use tphoto_common::events::TalkingPhotoState;

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A qualifying poster became the active anchor
    PosterDetected,
    CacheHit,
    CacheMiss,
    JobSubmitted,
    /// Download finished and the bytes verified
    VideoVerified,
    Autoplay,
    TrackingLost,
    TrackingRecovered,
    UserPause,
    UserResume,
    /// Tracking stopped for good and the anchor was released
    AnchorLost,
    /// Any terminal failure for the current poster
    Failed,
    DetectionTimeout,
    RefreshScan,
    /// App backgrounded or explicit release
    Release,
}

/// Target state for `trigger` in `from`, or None if not allowed
pub fn next_state(from: TalkingPhotoState, trigger: Trigger) -> Option<TalkingPhotoState> {
    use TalkingPhotoState::*;

    match (from, trigger) {
        // Escape hatches
        (_, Trigger::RefreshScan) | (_, Trigger::Release) => Some(Idle),

        // New poster replaces whatever was going on
        (_, Trigger::PosterDetected) => Some(FetchingVideo),

        (FetchingVideo, Trigger::CacheHit) => Some(Ready),
        (FetchingVideo, Trigger::CacheMiss) => Some(Generating),
        (Generating, Trigger::JobSubmitted) => Some(Downloading),
        (Downloading, Trigger::VideoVerified) => Some(Ready),
        (Ready, Trigger::Autoplay) => Some(Playing),

        (Playing, Trigger::TrackingLost) => Some(Paused),
        (Paused, Trigger::TrackingRecovered) => Some(Playing),
        (Playing, Trigger::UserPause) => Some(Paused),
        (Paused, Trigger::UserResume) => Some(Playing),

        (FetchingVideo | Generating | Downloading | Ready | Playing | Paused, Trigger::AnchorLost) => {
            Some(Idle)
        }
        (FetchingVideo | Generating | Downloading | Ready | Playing | Paused, Trigger::Failed) => {
            Some(Error)
        }
        (Idle, Trigger::DetectionTimeout) => Some(Error),

        _ => None,
    }
}
