//! Per-frame overlay rendering: screen placement, lip-region compositing
//! and background video decoding

pub mod compositor;
pub mod coordinator;
pub mod decoder;

pub use compositor::{LipRegionCompositor, VideoFrame};
pub use coordinator::{LipProjection, NormalizedRect, RenderCoordinator, ScreenRect};
pub use decoder::{
    DecodedState, FfmpegFrameSource, FfmpegSourceFactory, FrameDecoder, FrameSource,
    FrameSourceFactory, VideoInfo,
};

/// Default seam width, in normalized screen units
pub const DEFAULT_FEATHER_RADIUS: f32 = 0.02;

/// Render tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    /// Feather width of the lip overlay edge (normalized screen units)
    pub feather_radius: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            feather_radius: DEFAULT_FEATHER_RADIUS,
        }
    }
}
