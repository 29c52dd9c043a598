//! Test helpers for tphoto-ar integration tests
//!
//! - `FakeBackend`: in-process lip-sync backend on an ephemeral port with
//!   scriptable failures
//! - Tracking frame builders and poster fixtures
//! - `SolidFrames`: frame source that needs no decoder binaries

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use image::{Rgba, RgbaImage};
use nalgebra::{Matrix4, UnitQuaternion, Vector3};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tphoto_ar::cache::{CacheConfig, VideoCache};
use tphoto_ar::checksum::sha256_hex;
use tphoto_ar::fetch::{BackendClient, FetcherConfig, RetryPolicy, VideoProvider};
use tphoto_ar::model::{PosterId, ReferencePoster, TalkingPhotoRequest};
use tphoto_ar::render::{FrameSource, FrameSourceFactory, VideoFrame, VideoInfo};
use tphoto_ar::tracking::{ArFrame, CameraProjection, Detection, Observation, Pose, Viewport};
use tphoto_ar::Result;

// ============================================================================
// Fake backend
// ============================================================================

/// How status polls end
#[derive(Debug, Clone)]
pub enum Outcome {
    Complete,
    Fail(String),
    NeverFinish,
}

pub struct FakeState {
    pub generate_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    /// Status codes returned by successive generate calls before succeeding
    pub generate_failures: Mutex<VecDeque<u16>>,
    pub generate_delay: Mutex<Duration>,
    /// `processing` replies before the terminal one
    pub pending_polls: AtomicUsize,
    pub outcome: Mutex<Outcome>,
    pub video: Mutex<Vec<u8>>,
    pub declared_checksum: Mutex<Option<String>>,
    pub declared_size: Mutex<Option<u64>>,
    pub requests: Mutex<Vec<Value>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            generate_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            generate_failures: Mutex::new(VecDeque::new()),
            generate_delay: Mutex::new(Duration::ZERO),
            pending_polls: AtomicUsize::new(1),
            outcome: Mutex::new(Outcome::Complete),
            video: Mutex::new(fake_mp4(4096)),
            declared_checksum: Mutex::new(None),
            declared_size: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeState {
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn fail_generate_with(&self, codes: &[u16]) {
        self.generate_failures.lock().unwrap().extend(codes.iter().copied());
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_generate_delay(&self, delay: Duration) {
        *self.generate_delay.lock().unwrap() = delay;
    }

    pub fn set_video(&self, bytes: Vec<u8>) {
        *self.video.lock().unwrap() = bytes;
    }

    pub fn declare_checksum(&self, checksum: &str) {
        *self.declared_checksum.lock().unwrap() = Some(checksum.to_string());
    }

    pub fn declare_size(&self, size: u64) {
        *self.declared_size.lock().unwrap() = Some(size);
    }
}

/// Lip-sync backend served from the test process
pub struct FakeBackend {
    pub base_url: String,
    pub state: Arc<FakeState>,
    _server: tokio::task::JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/lipsync/generate", post(generate))
            .route("/lipsync/status/:job_id", get(status))
            .route("/videos/:name", get(video))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            _server: server,
        }
    }

    pub fn client(&self) -> BackendClient {
        BackendClient::new(fast_config(&self.base_url)).unwrap()
    }
}

async fn generate(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    let n = state.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
    state.requests.lock().unwrap().push(body);

    let delay = *state.generate_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let failure = state.generate_failures.lock().unwrap().pop_front();
    if let Some(code) = failure {
        let code = StatusCode::from_u16(code).unwrap();
        return (code, "scripted failure").into_response();
    }

    Json(json!({ "jobId": format!("J{}", n) })).into_response()
}

async fn status(State(state): State<Arc<FakeState>>, Path(job_id): Path<String>) -> Response {
    state.status_calls.fetch_add(1, Ordering::SeqCst);

    let outcome = state.outcome.lock().unwrap().clone();
    match outcome {
        Outcome::NeverFinish => return Json(json!({ "status": "processing" })).into_response(),
        Outcome::Fail(message) => {
            return Json(json!({ "status": "failed", "error": message })).into_response()
        }
        Outcome::Complete => {}
    }

    let pending = state.pending_polls.load(Ordering::SeqCst);
    if pending > 0 {
        state.pending_polls.store(pending - 1, Ordering::SeqCst);
        return Json(json!({ "status": "queued" })).into_response();
    }

    let video = state.video.lock().unwrap().clone();
    let checksum = state
        .declared_checksum
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| sha256_hex(&video));
    let size = state
        .declared_size
        .lock()
        .unwrap()
        .unwrap_or(video.len() as u64);

    Json(json!({
        "status": "completed",
        "videoUrl": format!("/videos/{}.mp4", job_id),
        "lipCoordinates": { "x": 0.4, "y": 0.5, "width": 0.2, "height": 0.15 },
        "checksum": checksum,
        "durationMs": 10_000,
        "sizeBytes": size,
    }))
    .into_response()
}

async fn video(State(state): State<Arc<FakeState>>, Path(_name): Path<String>) -> Response {
    state.download_calls.fetch_add(1, Ordering::SeqCst);
    let bytes = state.video.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "video/mp4")], bytes).into_response()
}

/// Client budgets shrunk for tests
pub fn fast_config(base_url: &str) -> FetcherConfig {
    FetcherConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        poll_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        },
        chunk_timeout: Duration::from_secs(2),
    }
}

/// Minimal bytes sniffed as an ISO base media (mp4) file
pub fn fake_mp4(len: usize) -> Vec<u8> {
    let mut bytes = vec![0, 0, 0, 0x20];
    bytes.extend_from_slice(b"ftypisom");
    bytes.extend_from_slice(&[0, 0, 2, 0]);
    bytes.extend_from_slice(b"isomiso2avc1mp41");
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}

// ============================================================================
// Cache / provider
// ============================================================================

pub async fn open_cache(dir: &TempDir) -> Arc<VideoCache> {
    Arc::new(
        VideoCache::open(CacheConfig::new(dir.path().join("cache")))
            .await
            .unwrap(),
    )
}

pub async fn provider(backend: &FakeBackend, dir: &TempDir) -> (Arc<VideoProvider>, Arc<VideoCache>) {
    let cache = open_cache(dir).await;
    let provider = VideoProvider::new(Arc::clone(&cache), Arc::new(backend.client()));
    (Arc::new(provider), cache)
}

pub fn request(poster: &str, text: &str, voice: &str) -> TalkingPhotoRequest {
    TalkingPhotoRequest {
        poster_id: PosterId::new(poster),
        text: text.to_string(),
        voice_id: voice.to_string(),
    }
}

// ============================================================================
// Tracking fixtures
// ============================================================================

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 150, 120, 255]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

pub fn poster(id: &str, has_human_face: bool) -> ReferencePoster {
    ReferencePoster {
        id: PosterId::new(id),
        image: Arc::new(png_bytes(40, 30)),
        physical_width_m: 0.4,
        has_human_face,
    }
}

pub fn camera() -> CameraProjection {
    CameraProjection {
        view: Matrix4::identity(),
        projection: Matrix4::new_perspective(640.0 / 480.0, std::f32::consts::FRAC_PI_3, 0.05, 100.0),
        viewport: Viewport {
            width: 640,
            height: 480,
        },
    }
}

/// Poster one meter ahead, facing the camera
pub fn facing_pose() -> Pose {
    Pose::new(
        Vector3::new(0.0, 0.0, -1.0),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::FRAC_PI_2),
    )
}

pub fn detected(timestamp_ms: u64, id: &str) -> ArFrame {
    ArFrame {
        timestamp_ms,
        camera: camera(),
        detections: vec![Detection {
            poster_id: PosterId::new(id),
            pose: facing_pose(),
        }],
        observations: vec![],
    }
}

fn observed(timestamp_ms: u64, id: &str, in_view: bool) -> ArFrame {
    ArFrame {
        timestamp_ms,
        camera: camera(),
        detections: vec![],
        observations: vec![Observation {
            poster_id: PosterId::new(id),
            pose: facing_pose(),
            quality: if in_view { 1.0 } else { 0.0 },
            in_view,
        }],
    }
}

pub fn tracked(timestamp_ms: u64, id: &str) -> ArFrame {
    observed(timestamp_ms, id, true)
}

pub fn lost(timestamp_ms: u64, id: &str) -> ArFrame {
    observed(timestamp_ms, id, false)
}

// ============================================================================
// Frame source
// ============================================================================

/// Solid red 32x32 frames at 25 fps, 10 s long, for any path
#[derive(Default)]
pub struct SolidFrames {
    pub opened: AtomicUsize,
    /// Where the picture stops, when shorter than the declared 10 s
    stream_end_ms: Option<u64>,
    past_end: Arc<AtomicUsize>,
}

impl SolidFrames {
    /// Declares 10 s but has no frames from `end_ms` on
    pub fn ending_at(end_ms: u64) -> Self {
        Self {
            stream_end_ms: Some(end_ms),
            ..Default::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Requests answered with no frame
    pub fn past_end_requests(&self) -> usize {
        self.past_end.load(Ordering::SeqCst)
    }
}

struct SolidSource {
    info: VideoInfo,
    end_ms: Option<u64>,
    past_end: Arc<AtomicUsize>,
}

impl FrameSource for SolidSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn frame_at(&mut self, position_ms: u64) -> Result<Option<VideoFrame>> {
        if self.end_ms.is_some_and(|end| position_ms >= end) {
            self.past_end.fetch_add(1, Ordering::SeqCst);
            return Ok(None);
        }
        let image = RgbaImage::from_pixel(32, 32, Rgba([255, 0, 0, 255]));
        let index = self.info.frame_index(position_ms);
        Ok(Some(VideoFrame::new(image, self.info.frame_position_ms(index))))
    }
}

impl FrameSourceFactory for SolidFrames {
    fn open(&self, _path: &std::path::Path) -> Result<Box<dyn FrameSource>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SolidSource {
            info: VideoInfo {
                width: 32,
                height: 32,
                fps: 25.0,
                duration_ms: 10_000,
            },
            end_ms: self.stream_end_ms,
            past_end: Arc::clone(&self.past_end),
        }))
    }
}

/// Poll `done` until it holds or about two seconds pass
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
