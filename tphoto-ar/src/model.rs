//! Core data model
//!
//! Catalog entries, lip-region coordinates and the fetch key shared by the
//! cache and the backend client.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Tolerance for floating-point edge checks on lip coordinates
const LIP_EPSILON: f32 = 1e-6;

/// Poster identity from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PosterId(pub String);

impl PosterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PosterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PosterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Immutable catalog entry loaned to the tracker at session start
#[derive(Debug, Clone)]
pub struct ReferencePoster {
    pub id: PosterId,
    /// Encoded reference image (PNG/JPEG)
    pub image: Arc<Vec<u8>>,
    /// Printed width in meters
    pub physical_width_m: f32,
    pub has_human_face: bool,
}

/// Mouth region in normalized video-frame coordinates
///
/// Always within `[0,1]`, non-degenerate, and `x+width ≤ 1`, `y+height ≤ 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLipCoordinates")]
pub struct LipCoordinates {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Deserialize)]
struct RawLipCoordinates {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl TryFrom<RawLipCoordinates> for LipCoordinates {
    type Error = Error;

    fn try_from(raw: RawLipCoordinates) -> Result<Self> {
        LipCoordinates::new(raw.x, raw.y, raw.width, raw.height)
    }
}

impl LipCoordinates {
    /// Validate and construct; tiny overshoots from float rounding are clamped
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Result<Self> {
        let values = [x, y, width, height];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::FormatInvalid(format!(
                "lip coordinates not finite: ({}, {}, {}, {})",
                x, y, width, height
            )));
        }
        if !(0.0..1.0).contains(&x) || !(0.0..1.0).contains(&y) {
            return Err(Error::FormatInvalid(format!(
                "lip origin outside frame: ({}, {})",
                x, y
            )));
        }
        if width <= 0.0 || height <= 0.0 {
            return Err(Error::FormatInvalid(format!(
                "lip region degenerate: {}x{}",
                width, height
            )));
        }
        if x + width > 1.0 + LIP_EPSILON || y + height > 1.0 + LIP_EPSILON {
            return Err(Error::FormatInvalid(format!(
                "lip region exceeds frame: ({}, {}, {}, {})",
                x, y, width, height
            )));
        }

        let width = width.min(1.0 - x);
        let height = height.min(1.0 - y);
        if width <= 0.0 || height <= 0.0 {
            return Err(Error::FormatInvalid(format!(
                "lip region degenerate after clamping: {}x{}",
                width, height
            )));
        }

        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }
}

/// Playback metadata reported with a generated video
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub lip: LipCoordinates,
    pub duration_ms: Option<u64>,
}

/// Dialogue assigned to a poster by the content collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialogue {
    pub text: String,
    pub voice_id: String,
}

/// Source of dialogue per poster
pub trait DialogueCatalog: Send + Sync {
    fn dialogue_for(&self, poster_id: &PosterId) -> Option<Dialogue>;
}

impl DialogueCatalog for HashMap<PosterId, Dialogue> {
    fn dialogue_for(&self, poster_id: &PosterId) -> Option<Dialogue> {
        self.get(poster_id).cloned()
    }
}

/// Fetch request: the triple that identifies one generated video
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TalkingPhotoRequest {
    #[serde(rename = "posterId")]
    pub poster_id: PosterId,
    pub text: String,
    #[serde(rename = "voiceId")]
    pub voice_id: String,
}

impl TalkingPhotoRequest {
    pub fn new(poster_id: PosterId, dialogue: Dialogue) -> Self {
        Self {
            poster_id,
            text: dialogue.text,
            voice_id: dialogue.voice_id,
        }
    }

    /// Stable cache key for this request
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_request(self)
    }
}

/// Content address of a generated video: SHA-256 over the request triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(request: &TalkingPhotoRequest) -> Self {
        let mut hasher = Sha256::new();
        // Length-prefixed fields so ("ab","c") and ("a","bc") differ
        for field in [
            request.poster_id.as_str(),
            request.text.as_str(),
            request.voice_id.as_str(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Rebuild from a stored index value
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
