//! Anchor tracker
//!
//! Wraps the host AR session and maintains at most one active tracked
//! poster.
//!
//! **Policy:**
//! - Only posters with a human face are registered; detections of anything
//!   else are ignored entirely (no anchor, no events)
//! - First qualifying detection creates the anchor
//! - Detection of a *different* poster replaces the active anchor
//! - Repeated detection of the *same* poster updates the pose in place,
//!   the anchor is never re-created
//! - Unusable tracking (out of frustum or quality below threshold) pauses;
//!   staying unusable for `lost_timeout` stops and releases the anchor

use crate::error::{Error, Result};
use crate::model::{PosterId, ReferencePoster};
use crate::tracking::session::{AnchorId, ArFrame, ArSession, CameraProjection, Pose};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tracker tuning
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum observation quality considered usable
    pub min_quality: f32,
    /// Time spent paused before tracking is declared unrecoverable
    pub lost_timeout: Duration,
    /// Time allowed without any qualifying detection while armed
    pub detection_timeout: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_quality: 0.5,
            lost_timeout: Duration::from_millis(3000),
            detection_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Anchor tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    Tracking,
    Paused,
    Stopped,
}

/// Physical poster extent in meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosterSize {
    pub width_m: f32,
    pub height_m: f32,
}

/// The single live anchor, mutated in place frame to frame
#[derive(Debug)]
struct TrackedAnchor {
    id: AnchorId,
    poster_id: PosterId,
    pose: Pose,
    state: TrackingState,
    created_at_ms: u64,
    lost_since_ms: Option<u64>,
}

/// Read-only copy of the active anchor handed to other components
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSnapshot {
    pub anchor_id: AnchorId,
    pub poster_id: PosterId,
    pub pose: Pose,
    pub state: TrackingState,
    pub created_at_ms: u64,
    pub poster_size: PosterSize,
}

/// Discrete change carried by an update
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingTransition {
    /// New anchor created; `replaced` names the poster it displaced
    Detected { replaced: Option<PosterId> },
    /// Tracking became unusable
    Paused,
    /// Tracking recovered after a pause
    Resumed,
    /// Tracking lost for good; anchor released
    Stopped,
}

/// Per-frame tracker output
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingUpdate {
    pub anchor: AnchorSnapshot,
    pub camera: CameraProjection,
    pub timestamp_ms: u64,
    pub transition: Option<TrackingTransition>,
}

#[derive(Debug, Clone, Copy)]
struct PosterGeometry {
    size: PosterSize,
}

/// Lifecycle of the owned session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionLifecycle {
    Running,
    Suspended,
    Released,
}

/// Single-active-poster anchor tracker
pub struct AnchorTracker {
    session: Box<dyn ArSession>,
    config: TrackerConfig,
    posters: HashMap<PosterId, PosterGeometry>,
    active: Option<TrackedAnchor>,
    /// Start of the current detection window; None until the next frame arms it
    armed_since_ms: Option<u64>,
    rearm_pending: bool,
    detection_timeout_fired: bool,
    pending_timeout: Option<Duration>,
    last_timestamp_ms: Option<u64>,
    lifecycle: SessionLifecycle,
}

impl AnchorTracker {
    pub fn new(session: Box<dyn ArSession>, config: TrackerConfig) -> Self {
        Self {
            session,
            config,
            posters: HashMap::new(),
            active: None,
            armed_since_ms: None,
            rearm_pending: true,
            detection_timeout_fired: false,
            pending_timeout: None,
            last_timestamp_ms: None,
            lifecycle: SessionLifecycle::Running,
        }
    }

    /// Register the catalog posters for detection
    ///
    /// Non-face posters are dropped here and never reach the session.
    /// Reference images must decode far enough to read their dimensions.
    pub fn initialize(&mut self, posters: &[ReferencePoster]) -> Result<()> {
        self.ensure_not_released()?;

        let mut registered = Vec::new();
        self.posters.clear();

        for poster in posters {
            if !poster.has_human_face {
                debug!(poster_id = %poster.id, "Skipping poster without human face");
                continue;
            }
            if !(poster.physical_width_m.is_finite() && poster.physical_width_m > 0.0) {
                return Err(Error::Config(format!(
                    "Poster {} has invalid physical width {}",
                    poster.id, poster.physical_width_m
                )));
            }

            let (px_w, px_h) = image::ImageReader::new(Cursor::new(poster.image.as_slice()))
                .with_guessed_format()
                .map_err(|e| {
                    Error::Config(format!("Poster {} image unreadable: {}", poster.id, e))
                })?
                .into_dimensions()
                .map_err(|e| {
                    Error::Config(format!("Poster {} image unreadable: {}", poster.id, e))
                })?;
            if px_w == 0 || px_h == 0 {
                return Err(Error::Config(format!(
                    "Poster {} image has zero size",
                    poster.id
                )));
            }

            let width_m = poster.physical_width_m;
            let height_m = width_m * px_h as f32 / px_w as f32;
            self.posters.insert(
                poster.id.clone(),
                PosterGeometry {
                    size: PosterSize { width_m, height_m },
                },
            );
            registered.push(poster.clone());
        }

        self.session.register_reference_images(&registered)?;
        info!(
            registered = registered.len(),
            ignored = posters.len() - registered.len(),
            "Reference posters registered"
        );

        self.rearm();
        Ok(())
    }

    /// Process one host frame
    ///
    /// Returns an update whenever an anchor is live (every frame), or the
    /// final `Stopped` update when it is released. Frames older than the
    /// last processed frame are dropped to keep pose delivery ordered.
    pub fn process_frame(&mut self, frame: &ArFrame) -> Option<TrackingUpdate> {
        if self.lifecycle != SessionLifecycle::Running {
            return None;
        }

        if let Some(last) = self.last_timestamp_ms {
            if frame.timestamp_ms < last {
                debug!(
                    timestamp_ms = frame.timestamp_ms,
                    last_ms = last,
                    "Dropping out-of-order frame"
                );
                return None;
            }
        }
        self.last_timestamp_ms = Some(frame.timestamp_ms);

        if self.rearm_pending {
            self.rearm_pending = false;
            self.armed_since_ms = Some(frame.timestamp_ms);
        }

        let mut transition = self.apply_detections(frame);

        if transition.is_none() {
            transition = self.apply_observations(frame);
        }

        if self.active.is_none() {
            self.check_detection_timeout(frame.timestamp_ms);
        }

        match transition {
            Some(TrackingTransition::Stopped) => {
                let stopped = self.active.take()?;
                self.session.release_anchor(stopped.id);
                info!(
                    anchor = %stopped.id,
                    poster_id = %stopped.poster_id,
                    "Tracking lost, anchor released"
                );
                let size = self.poster_size(&stopped.poster_id);
                self.rearm();
                Some(TrackingUpdate {
                    anchor: AnchorSnapshot {
                        anchor_id: stopped.id,
                        poster_id: stopped.poster_id,
                        pose: stopped.pose,
                        state: TrackingState::Stopped,
                        created_at_ms: stopped.created_at_ms,
                        poster_size: size,
                    },
                    camera: frame.camera,
                    timestamp_ms: frame.timestamp_ms,
                    transition: Some(TrackingTransition::Stopped),
                })
            }
            other => self.active_anchor().map(|anchor| TrackingUpdate {
                anchor,
                camera: frame.camera,
                timestamp_ms: frame.timestamp_ms,
                transition: other,
            }),
        }
    }

    /// Discard the current anchor and re-arm detection
    pub fn refresh_scan(&mut self) {
        if let Some(anchor) = self.active.take() {
            self.session.release_anchor(anchor.id);
            info!(anchor = %anchor.id, poster_id = %anchor.poster_id, "Refresh scan released anchor");
        }
        self.rearm();
    }

    /// Pause the host session (app backgrounded); the anchor is released
    pub fn suspend(&mut self) {
        if self.lifecycle != SessionLifecycle::Running {
            return;
        }
        if let Some(anchor) = self.active.take() {
            self.session.release_anchor(anchor.id);
        }
        self.session.pause();
        self.lifecycle = SessionLifecycle::Suspended;
        info!("AR session suspended");
    }

    /// Resume the host session after `suspend`
    pub fn resume(&mut self) -> Result<()> {
        match self.lifecycle {
            SessionLifecycle::Running => Ok(()),
            SessionLifecycle::Released => Err(Error::InvalidState(
                "AR session already released".to_string(),
            )),
            SessionLifecycle::Suspended => {
                self.session.resume()?;
                self.lifecycle = SessionLifecycle::Running;
                // Host timestamps may restart after a resume
                self.last_timestamp_ms = None;
                self.rearm();
                info!("AR session resumed");
                Ok(())
            }
        }
    }

    /// Tear down the session; the tracker is unusable afterwards
    pub fn release(&mut self) {
        if self.lifecycle == SessionLifecycle::Released {
            return;
        }
        if let Some(anchor) = self.active.take() {
            self.session.release_anchor(anchor.id);
        }
        self.session.teardown();
        self.lifecycle = SessionLifecycle::Released;
        info!("AR session released");
    }

    /// Detection window expiry, reported once per arming
    pub fn take_detection_timeout(&mut self) -> Option<Duration> {
        self.pending_timeout.take()
    }

    /// Snapshot of the active anchor
    pub fn active_anchor(&self) -> Option<AnchorSnapshot> {
        self.active.as_ref().map(|anchor| AnchorSnapshot {
            anchor_id: anchor.id,
            poster_id: anchor.poster_id.clone(),
            pose: anchor.pose,
            state: anchor.state,
            created_at_ms: anchor.created_at_ms,
            poster_size: self.poster_size(&anchor.poster_id),
        })
    }

    pub fn is_released(&self) -> bool {
        self.lifecycle == SessionLifecycle::Released
    }

    fn ensure_not_released(&self) -> Result<()> {
        if self.lifecycle == SessionLifecycle::Released {
            return Err(Error::InvalidState(
                "AR session already released".to_string(),
            ));
        }
        Ok(())
    }

    fn rearm(&mut self) {
        self.rearm_pending = true;
        self.armed_since_ms = None;
        self.detection_timeout_fired = false;
        self.pending_timeout = None;
    }

    fn poster_size(&self, poster_id: &PosterId) -> PosterSize {
        self.posters
            .get(poster_id)
            .map(|g| g.size)
            .unwrap_or(PosterSize {
                width_m: 0.0,
                height_m: 0.0,
            })
    }

    /// Handle detection events: reuse, create or replace the anchor
    fn apply_detections(&mut self, frame: &ArFrame) -> Option<TrackingTransition> {
        let qualifying: Vec<_> = frame
            .detections
            .iter()
            .filter(|d| self.posters.contains_key(&d.poster_id))
            .collect();

        if qualifying.is_empty() {
            return None;
        }

        // Same poster re-detected: update in place, prefer it over others in this frame
        if let Some(active) = self.active.as_mut() {
            if let Some(same) = qualifying.iter().find(|d| d.poster_id == active.poster_id) {
                active.pose = same.pose;
                active.lost_since_ms = None;
                if active.state == TrackingState::Paused {
                    active.state = TrackingState::Tracking;
                    return Some(TrackingTransition::Resumed);
                }
                return None;
            }
        }

        let detection = qualifying[0];
        let replaced = match self.active.take() {
            Some(previous) => {
                self.session.release_anchor(previous.id);
                info!(
                    previous = %previous.poster_id,
                    next = %detection.poster_id,
                    "Different poster detected, replacing anchor"
                );
                Some(previous.poster_id)
            }
            None => None,
        };

        match self.session.create_anchor(&detection.poster_id, &detection.pose) {
            Ok(id) => {
                info!(anchor = %id, poster_id = %detection.poster_id, "Anchor created");
                self.active = Some(TrackedAnchor {
                    id,
                    poster_id: detection.poster_id.clone(),
                    pose: detection.pose,
                    state: TrackingState::Tracking,
                    created_at_ms: frame.timestamp_ms,
                    lost_since_ms: None,
                });
                self.armed_since_ms = None;
                self.pending_timeout = None;
                Some(TrackingTransition::Detected { replaced })
            }
            Err(e) => {
                warn!(poster_id = %detection.poster_id, error = %e, "Anchor creation failed");
                if replaced.is_some() {
                    self.rearm();
                }
                None
            }
        }
    }

    /// Apply per-frame tracking observations to the active anchor
    fn apply_observations(&mut self, frame: &ArFrame) -> Option<TrackingTransition> {
        let min_quality = self.config.min_quality;
        let lost_timeout_ms = self.config.lost_timeout.as_millis() as u64;
        let active = self.active.as_mut()?;

        let observation = frame
            .observations
            .iter()
            .find(|o| o.poster_id == active.poster_id);

        let usable = observation
            .map(|o| o.in_view && o.quality >= min_quality)
            .unwrap_or(false);

        if let Some(obs) = observation {
            if obs.in_view {
                active.pose = obs.pose;
            }
        }

        if usable {
            active.lost_since_ms = None;
            if active.state == TrackingState::Paused {
                active.state = TrackingState::Tracking;
                debug!(poster_id = %active.poster_id, "Tracking recovered");
                return Some(TrackingTransition::Resumed);
            }
            return None;
        }

        match active.state {
            TrackingState::Tracking => {
                active.state = TrackingState::Paused;
                active.lost_since_ms = Some(frame.timestamp_ms);
                debug!(poster_id = %active.poster_id, "Tracking unusable, pausing");
                Some(TrackingTransition::Paused)
            }
            TrackingState::Paused => {
                let since = *active.lost_since_ms.get_or_insert(frame.timestamp_ms);
                if frame.timestamp_ms.saturating_sub(since) >= lost_timeout_ms {
                    active.state = TrackingState::Stopped;
                    Some(TrackingTransition::Stopped)
                } else {
                    None
                }
            }
            TrackingState::Stopped => Some(TrackingTransition::Stopped),
        }
    }

    fn check_detection_timeout(&mut self, now_ms: u64) {
        let (Some(timeout), Some(since)) = (self.config.detection_timeout, self.armed_since_ms)
        else {
            return;
        };
        if self.detection_timeout_fired {
            return;
        }
        if now_ms.saturating_sub(since) >= timeout.as_millis() as u64 {
            self.detection_timeout_fired = true;
            self.pending_timeout = Some(timeout);
            warn!(timeout_ms = timeout.as_millis() as u64, "No poster detected in time");
        }
    }
}
