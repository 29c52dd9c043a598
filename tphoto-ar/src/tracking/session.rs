//! AR session boundary
//!
//! The host AR subsystem is consumed only through these types: per-frame
//! camera parameters, image detection events, per-image tracking
//! observations, and an owned session handle for anchors and lifecycle.

use crate::error::Result;
use crate::model::{PosterId, ReferencePoster};
use nalgebra::{Isometry3, Matrix4, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid pose in world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub orientation: UnitQuaternion<f32>,
}

impl Pose {
    pub fn new(position: Vector3<f32>, orientation: UnitQuaternion<f32>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Local-to-world transform
    pub fn model_matrix(&self) -> Matrix4<f32> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation).to_homogeneous()
    }
}

/// Output surface size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Camera parameters delivered with every frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraProjection {
    /// World-to-camera transform
    pub view: Matrix4<f32>,
    /// Camera-to-clip transform (OpenGL convention, NDC in [-1,1])
    pub projection: Matrix4<f32>,
    pub viewport: Viewport,
}

/// Image newly detected this frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub poster_id: PosterId,
    pub pose: Pose,
}

/// Ongoing tracking result for an already-detected image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub poster_id: PosterId,
    pub pose: Pose,
    /// Tracking quality in [0,1]
    pub quality: f32,
    /// Whether the image is inside the camera frustum
    pub in_view: bool,
}

/// One host frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArFrame {
    /// Monotonic host timestamp
    pub timestamp_ms: u64,
    pub camera: CameraProjection,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

/// Host-assigned anchor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorId(pub u64);

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anchor-{}", self.0)
    }
}

/// Owned handle to the host AR session
///
/// The session has an init/pause/resume/teardown lifecycle tied to the app
/// being in the foreground. The tracker owns it exclusively.
pub trait ArSession: Send {
    /// Register reference images for detection
    fn register_reference_images(&mut self, posters: &[ReferencePoster]) -> Result<()>;

    /// Create a spatial anchor bound to a detected image
    fn create_anchor(&mut self, poster_id: &PosterId, pose: &Pose) -> Result<AnchorId>;

    /// Release a previously created anchor
    fn release_anchor(&mut self, anchor: AnchorId);

    /// Suspend camera and tracking (app backgrounded)
    fn pause(&mut self);

    /// Resume after `pause`
    fn resume(&mut self) -> Result<()>;

    /// Destroy the session; no further calls are valid
    fn teardown(&mut self);
}
