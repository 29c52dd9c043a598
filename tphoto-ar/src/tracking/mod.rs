//! Poster detection and anchor tracking

pub mod anchor_tracker;
pub mod replay;
pub mod session;

pub use anchor_tracker::{
    AnchorSnapshot, AnchorTracker, PosterSize, TrackerConfig, TrackingState, TrackingTransition,
    TrackingUpdate,
};
pub use replay::ReplaySession;
pub use session::{
    AnchorId, ArFrame, ArSession, CameraProjection, Detection, Observation, Pose, Viewport,
};
