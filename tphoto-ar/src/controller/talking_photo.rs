//! Talking-photo controller
//!
//! Owned by the render loop and driven one frame at a time through
//! `on_frame`, which never blocks:
//! 1. Apply queued UI commands
//! 2. Feed the frame to the anchor tracker and react to its transitions
//! 3. Drain fetch progress/results posted by the worker pool
//! 4. Composite the current video frame over the lip region
//!
//! Each fetch carries a generation number. Refresh, release, or a new
//! poster bump the generation and cancel the running fetch, so a late
//! result for an older poster is discarded here, never rendered.

use crate::controller::handle::{ControllerCommand, ControllerHandle};
use crate::controller::state::{next_state, Trigger};
use crate::error::{Error, Result};
use crate::fetch::{FetchResult, FetchStage, PreparedVideo, VideoOrigin, VideoSource};
use crate::model::{DialogueCatalog, PosterId, ReferencePoster, TalkingPhotoRequest};
use crate::render::{
    FrameDecoder, FrameSourceFactory, LipProjection, LipRegionCompositor, RenderConfig,
    RenderCoordinator, ScreenRect,
};
use crate::tracking::{
    AnchorSnapshot, AnchorTracker, ArFrame, TrackingState, TrackingTransition, TrackingUpdate,
};
use chrono::Utc;
use image::RgbaImage;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tphoto_common::events::{ControllerEvent, ErrorReport, StateSnapshot, TalkingPhotoState};
use tracing::{debug, info, warn};

/// Event broadcast buffer
const EVENT_CAPACITY: usize = 100;

/// Why playback is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Resumes by itself when tracking recovers
    TrackingLost,
    /// Resumes only on an explicit `resume`
    User,
}

enum FetchMessage {
    Stage { generation: u64, stage: FetchStage },
    Finished { generation: u64, result: FetchResult },
}

/// Running fetch; dropping it cancels the worker task
struct ActiveFetch {
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for ActiveFetch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Playback resources, held only while `Playing`
struct Playback {
    decoder: FrameDecoder,
    compositor: LipRegionCompositor,
    /// Video position at `started_at_ms`
    base_position_ms: u64,
    /// Host timestamp of the first rendered frame since (re)start
    started_at_ms: Option<u64>,
}

/// What one frame produced
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub state: TalkingPhotoState,
    pub position_ms: u64,
    /// Lip rectangle drawn this frame
    pub overlay: Option<ScreenRect>,
    pub composited_pixels: usize,
}

/// Top-level orchestrator of detection, fetch and playback
pub struct TalkingPhotoController {
    tracker: AnchorTracker,
    source: Arc<dyn VideoSource>,
    catalog: Arc<dyn DialogueCatalog>,
    frames: Arc<dyn FrameSourceFactory>,
    runtime: tokio::runtime::Handle,
    render_config: RenderConfig,
    coordinator: RenderCoordinator,

    state: TalkingPhotoState,
    poster: Option<PosterId>,
    position_ms: u64,
    pause_reason: Option<PauseReason>,
    error: Option<ErrorReport>,

    generation: u64,
    fetch: Option<ActiveFetch>,
    fetch_tx: mpsc::UnboundedSender<FetchMessage>,
    fetch_rx: mpsc::UnboundedReceiver<FetchMessage>,
    video: Option<PreparedVideo>,
    playback: Option<Playback>,

    commands: mpsc::UnboundedReceiver<ControllerCommand>,
    state_tx: watch::Sender<StateSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
    handle: ControllerHandle,
}

impl TalkingPhotoController {
    pub fn new(
        tracker: AnchorTracker,
        source: Arc<dyn VideoSource>,
        catalog: Arc<dyn DialogueCatalog>,
        frames: Arc<dyn FrameSourceFactory>,
        runtime: tokio::runtime::Handle,
        render_config: RenderConfig,
    ) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StateSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ControllerHandle::new(command_tx, state_rx, events.clone());

        Self {
            tracker,
            source,
            catalog,
            frames,
            runtime,
            render_config,
            coordinator: RenderCoordinator::new(),
            state: TalkingPhotoState::Idle,
            poster: None,
            position_ms: 0,
            pause_reason: None,
            error: None,
            generation: 0,
            fetch: None,
            fetch_tx,
            fetch_rx,
            video: None,
            playback: None,
            commands,
            state_tx,
            events,
            handle,
        }
    }

    /// Register the poster catalog with the tracker
    pub fn initialize(&mut self, posters: &[ReferencePoster]) -> Result<()> {
        self.tracker.initialize(posters)
    }

    /// Command/observation handle for the UI
    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> TalkingPhotoState {
        self.state
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.pause_reason
    }

    pub fn tracker(&self) -> &AnchorTracker {
        &self.tracker
    }

    /// Whether decoder resources are currently held
    pub fn has_playback_resources(&self) -> bool {
        self.playback.is_some()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            poster_id: self.poster.as_ref().map(|p| p.to_string()),
            position_ms: self.position_ms,
            error: self.error.clone(),
        }
    }

    /// Process one camera frame and draw the overlay into `camera_image`
    pub fn on_frame(&mut self, frame: &ArFrame, camera_image: &mut RgbaImage) -> FrameReport {
        self.drain_commands();

        let update = self.tracker.process_frame(frame);
        if let Some(update) = &update {
            self.apply_tracking(update);
        }
        if let Some(waited) = self.tracker.take_detection_timeout() {
            if self.state == TalkingPhotoState::Idle {
                self.fail(Trigger::DetectionTimeout, Error::PosterDetectionTimeout(waited).report());
            }
        }

        self.drain_fetch_messages();

        let report = self.render(update.as_ref(), camera_image);
        self.publish_snapshot();
        report
    }

    /// Apply queued commands and fetch results without a camera frame
    pub fn pump(&mut self) {
        self.drain_commands();
        self.drain_fetch_messages();
        self.publish_snapshot();
    }

    /// Apply one UI command immediately
    pub fn apply(&mut self, command: ControllerCommand) {
        debug!(?command, state = %self.state, "Applying command");
        match command {
            ControllerCommand::RefreshScan => {
                self.tracker.refresh_scan();
                self.reset(Trigger::RefreshScan);
            }
            ControllerCommand::Pause => match (self.state, self.pause_reason) {
                (TalkingPhotoState::Playing, _) => self.pause_playback(PauseReason::User),
                (TalkingPhotoState::Paused, Some(PauseReason::TrackingLost)) => {
                    // Keep paused after tracking comes back
                    self.pause_reason = Some(PauseReason::User);
                }
                _ => debug!(state = %self.state, "Pause ignored"),
            },
            ControllerCommand::Resume => {
                if self.state == TalkingPhotoState::Paused
                    && self.pause_reason == Some(PauseReason::User)
                {
                    if self.anchor_tracking() {
                        self.resume_playback(Trigger::UserResume);
                    } else {
                        // Resume as soon as the poster is tracked again
                        self.pause_reason = Some(PauseReason::TrackingLost);
                    }
                } else {
                    debug!(state = %self.state, "Resume ignored");
                }
            }
            ControllerCommand::Background => {
                self.tracker.suspend();
                self.reset(Trigger::Release);
            }
            ControllerCommand::Foreground => {
                if let Err(e) = self.tracker.resume() {
                    warn!(error = %e, "Cannot resume AR session");
                }
            }
            ControllerCommand::Release => {
                self.tracker.release();
                self.reset(Trigger::Release);
            }
        }
        self.publish_snapshot();
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply_tracking(&mut self, update: &TrackingUpdate) {
        match &update.transition {
            Some(TrackingTransition::Detected { replaced }) => {
                if let Some(previous) = replaced {
                    info!(
                        previous = %previous,
                        poster_id = %update.anchor.poster_id,
                        "Active poster replaced"
                    );
                }
                self.on_poster_detected(&update.anchor);
            }
            Some(TrackingTransition::Paused) => {
                if self.state == TalkingPhotoState::Playing {
                    self.pause_playback(PauseReason::TrackingLost);
                }
            }
            Some(TrackingTransition::Resumed) => {
                if self.state == TalkingPhotoState::Paused
                    && self.pause_reason == Some(PauseReason::TrackingLost)
                {
                    self.resume_playback(Trigger::TrackingRecovered);
                }
            }
            Some(TrackingTransition::Stopped) => {
                if !matches!(
                    self.state,
                    TalkingPhotoState::Idle | TalkingPhotoState::Error
                ) {
                    self.reset(Trigger::AnchorLost);
                }
            }
            None => {}
        }
    }

    fn on_poster_detected(&mut self, anchor: &AnchorSnapshot) {
        self.release_resources();
        self.poster = Some(anchor.poster_id.clone());
        self.position_ms = 0;
        self.error = None;
        self.transition(Trigger::PosterDetected);

        match self.catalog.dialogue_for(&anchor.poster_id) {
            Some(dialogue) => {
                self.start_fetch(TalkingPhotoRequest::new(anchor.poster_id.clone(), dialogue))
            }
            None => {
                let err = Error::Config(format!("No dialogue for poster {}", anchor.poster_id));
                self.fail(Trigger::Failed, err.report());
            }
        }
    }

    fn start_fetch(&mut self, request: TalkingPhotoRequest) {
        self.generation += 1;
        let generation = self.generation;
        let poster_id = request.poster_id.clone();

        let ticket = self.source.fetch(request);
        let key = ticket.key().clone();
        let mut progress = ticket.progress();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.fetch_tx.clone();

        info!(poster_id = %poster_id, key = %key, generation, "Fetching video");

        self.runtime.spawn(async move {
            let wait = ticket.wait();
            tokio::pin!(wait);

            // Joined flights may already be past the cache check
            let initial = *progress.borrow_and_update();
            if initial != FetchStage::Checking {
                let _ = tx.send(FetchMessage::Stage {
                    generation,
                    stage: initial,
                });
            }

            let mut progress_open = true;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(key = %key, generation, "Fetch cancelled");
                        return;
                    }
                    changed = progress.changed(), if progress_open => match changed {
                        Ok(()) => {
                            let stage = *progress.borrow_and_update();
                            let _ = tx.send(FetchMessage::Stage { generation, stage });
                        }
                        Err(_) => progress_open = false,
                    },
                    result = &mut wait => {
                        let _ = tx.send(FetchMessage::Finished { generation, result });
                        return;
                    }
                }
            }
        });

        self.fetch = Some(ActiveFetch { generation, cancel });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.fetch.as_ref().map(|f| f.generation) == Some(generation)
    }

    fn drain_fetch_messages(&mut self) {
        while let Ok(message) = self.fetch_rx.try_recv() {
            match message {
                FetchMessage::Stage { generation, stage } => {
                    if !self.is_current(generation) {
                        debug!(generation, ?stage, "Discarding stale fetch progress");
                        continue;
                    }
                    self.advance_fetch_stage(stage);
                }
                FetchMessage::Finished { generation, result } => {
                    if !self.is_current(generation) {
                        debug!(generation, "Discarding stale fetch result");
                        continue;
                    }
                    self.fetch = None;
                    match result {
                        Ok(video) => self.on_video_ready(video),
                        Err(e) => {
                            warn!(error = %e, poster_id = ?self.poster, "Fetch failed");
                            self.fail(Trigger::Failed, e.report());
                        }
                    }
                }
            }
        }
    }

    /// Walk the fetch states up to `stage`; progress may skip intermediate values
    fn advance_fetch_stage(&mut self, stage: FetchStage) {
        match stage {
            FetchStage::Checking => {}
            FetchStage::Generating => {
                if self.state == TalkingPhotoState::FetchingVideo {
                    self.transition(Trigger::CacheMiss);
                }
            }
            FetchStage::Downloading => {
                if self.state == TalkingPhotoState::FetchingVideo {
                    self.transition(Trigger::CacheMiss);
                }
                if self.state == TalkingPhotoState::Generating {
                    self.transition(Trigger::JobSubmitted);
                }
            }
        }
    }

    fn on_video_ready(&mut self, video: PreparedVideo) {
        let ready = match (video.origin, self.state) {
            (VideoOrigin::Cache, TalkingPhotoState::FetchingVideo) => {
                self.transition(Trigger::CacheHit)
            }
            _ => {
                self.advance_fetch_stage(FetchStage::Downloading);
                self.transition(Trigger::VideoVerified)
            }
        };
        if !ready {
            return;
        }

        info!(
            poster_id = ?self.poster,
            key = %video.key,
            origin = ?video.origin,
            "Video ready"
        );
        self.video = Some(video);
        self.maybe_autoplay();
    }

    fn anchor_tracking(&self) -> bool {
        self.tracker
            .active_anchor()
            .map(|a| a.state == TrackingState::Tracking)
            .unwrap_or(false)
    }

    fn maybe_autoplay(&mut self) {
        if self.state == TalkingPhotoState::Ready
            && self.anchor_tracking()
            && self.transition(Trigger::Autoplay)
        {
            self.start_playback(0);
        }
    }

    fn start_playback(&mut self, position_ms: u64) {
        let Some(video) = &self.video else {
            let err = Error::InvalidState("playback started without a video".to_string());
            self.fail(Trigger::Failed, err.report());
            return;
        };

        let decoder = FrameDecoder::start(
            &self.runtime,
            Arc::clone(&self.frames),
            video.path().to_path_buf(),
            position_ms,
        );
        self.playback = Some(Playback {
            decoder,
            compositor: LipRegionCompositor::new(video.meta.lip),
            base_position_ms: position_ms,
            started_at_ms: None,
        });
        self.position_ms = position_ms;

        if let Some(poster) = &self.poster {
            self.emit(ControllerEvent::PlaybackResumed {
                poster_id: poster.to_string(),
                position_ms,
                timestamp: Utc::now(),
            });
        }
    }

    fn pause_playback(&mut self, reason: PauseReason) {
        let trigger = match reason {
            PauseReason::TrackingLost => Trigger::TrackingLost,
            PauseReason::User => Trigger::UserPause,
        };
        if !self.transition(trigger) {
            return;
        }

        // Decoder released; position of the last rendered frame kept
        self.playback = None;
        self.pause_reason = Some(reason);
        info!(poster_id = ?self.poster, position_ms = self.position_ms, ?reason, "Playback paused");

        if let Some(poster) = &self.poster {
            self.emit(ControllerEvent::PlaybackPaused {
                poster_id: poster.to_string(),
                position_ms: self.position_ms,
                timestamp: Utc::now(),
            });
        }
    }

    fn resume_playback(&mut self, trigger: Trigger) {
        if !self.transition(trigger) {
            return;
        }
        self.pause_reason = None;
        info!(poster_id = ?self.poster, position_ms = self.position_ms, "Playback resumed");
        self.start_playback(self.position_ms);
    }

    fn render(&mut self, update: Option<&TrackingUpdate>, camera_image: &mut RgbaImage) -> FrameReport {
        if self.state == TalkingPhotoState::Ready {
            self.maybe_autoplay();
        }

        let mut report = FrameReport {
            state: self.state,
            position_ms: self.position_ms,
            overlay: None,
            composited_pixels: 0,
        };
        if self.state != TalkingPhotoState::Playing {
            return report;
        }
        let Some(update) = update.filter(|u| u.anchor.state == TrackingState::Tracking) else {
            return report;
        };

        let decode_error = self.playback.as_ref().and_then(|p| p.decoder.error());
        if let Some(message) = decode_error {
            warn!(poster_id = ?self.poster, error = %message, "Playback failed");
            self.fail(Trigger::Failed, Error::Decode(message).report());
            report.state = self.state;
            return report;
        }

        let meta_duration = self.video.as_ref().and_then(|v| v.meta.duration_ms);
        let Some(playback) = self.playback.as_mut() else {
            return report;
        };

        let started = *playback.started_at_ms.get_or_insert(update.timestamp_ms);
        let mut position =
            playback.base_position_ms + update.timestamp_ms.saturating_sub(started);
        let duration = meta_duration
            .or_else(|| playback.decoder.info().map(|i| i.duration_ms))
            .filter(|d| *d > 0);
        if let Some(duration) = duration {
            // Loop
            position %= duration;
        }
        self.position_ms = position;
        report.position_ms = position;

        playback.decoder.request(position);
        let Some(video_frame) = playback.decoder.latest() else {
            return report;
        };

        let projection = self.coordinator.compute_transform(
            &update.anchor.pose,
            &update.camera,
            update.anchor.poster_size,
            playback.compositor.lip(),
        );
        let LipProjection::Visible(rect) = projection else {
            return report;
        };

        match playback.compositor.render(
            camera_image,
            &video_frame,
            &rect,
            self.render_config.feather_radius,
        ) {
            Ok(pixels) => {
                report.overlay = Some(rect);
                report.composited_pixels = pixels;
            }
            Err(e) => warn!(error = %e, "Skipping overlay for this frame"),
        }
        report
    }

    /// Drop fetch, playback and video; the cache pin goes with the video
    fn release_resources(&mut self) {
        if self.fetch.take().is_some() {
            self.generation += 1;
        }
        self.playback = None;
        self.video = None;
        self.pause_reason = None;
    }

    fn reset(&mut self, trigger: Trigger) {
        self.release_resources();
        self.poster = None;
        self.position_ms = 0;
        self.error = None;
        self.coordinator.invalidate();
        self.transition(trigger);
    }

    fn fail(&mut self, trigger: Trigger, report: ErrorReport) {
        self.release_resources();
        if !self.transition(trigger) {
            return;
        }
        warn!(poster_id = ?self.poster, error = %report, "Talking photo failed");
        self.error = Some(report.clone());
        self.emit(ControllerEvent::ErrorRaised {
            error: report,
            poster_id: self.poster.as_ref().map(|p| p.to_string()),
            timestamp: Utc::now(),
        });
    }

    /// Apply `trigger`; false if the table rejects it
    fn transition(&mut self, trigger: Trigger) -> bool {
        let Some(next) = next_state(self.state, trigger) else {
            debug!(state = %self.state, ?trigger, "Trigger not valid in current state");
            return false;
        };
        if next == self.state {
            return true;
        }

        let old = self.state;
        self.state = next;
        info!(old_state = %old, new_state = %next, poster_id = ?self.poster, "State changed");
        self.emit(ControllerEvent::StateChanged {
            old_state: old,
            new_state: next,
            poster_id: self.poster.as_ref().map(|p| p.to_string()),
            timestamp: Utc::now(),
        });
        true
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
