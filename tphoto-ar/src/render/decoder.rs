//! Video frame decoding off the render loop
//!
//! A `FrameSource` produces RGBA frames for a playback position. The ffmpeg
//! source streams raw frames from a long-lived subprocess and only restarts
//! it on backward or long forward seeks. Positions past the last frame of
//! the stream (the declared duration may run longer than the picture) yield
//! no frame, and the previously decoded frame stays on screen.
//!
//! `FrameDecoder` owns one source on the worker pool. The render loop posts
//! the wanted position and reads the most recent decoded frame from a
//! single-slot mailbox; it never waits for decoding.

use crate::error::{Error, Result};
use crate::render::compositor::VideoFrame;
use image::RgbaImage;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Forward seeks longer than this restart the decoder instead of skipping
const MAX_SKIP_MS: u64 = 2000;

/// Stream properties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_ms: u64,
}

impl VideoInfo {
    /// Index of the frame shown at `position_ms`
    pub fn frame_index(&self, position_ms: u64) -> u64 {
        if self.fps <= 0.0 {
            return 0;
        }
        ((position_ms as f64) * self.fps / 1000.0).floor() as u64
    }

    /// Presentation time of frame `index`
    pub fn frame_position_ms(&self, index: u64) -> u64 {
        if self.fps <= 0.0 {
            return 0;
        }
        ((index as f64) * 1000.0 / self.fps).round() as u64
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Random-access frame producer (blocking)
pub trait FrameSource: Send {
    fn info(&self) -> &VideoInfo;

    /// Frame displayed at `position_ms`; None past the end of the stream
    fn frame_at(&mut self, position_ms: u64) -> Result<Option<VideoFrame>>;
}

/// Opens frame sources for cached video files (blocking)
pub trait FrameSourceFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOut {
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

fn parse_ff_ratio(s: &str) -> Option<f64> {
    let mut parts = s.split('/');
    let num = parts.next()?.trim().parse::<u32>().ok()?;
    let den = parts.next()?.trim().parse::<u32>().ok()?;
    if den == 0 || num == 0 {
        return None;
    }
    Some(f64::from(num) / f64::from(den))
}

/// Interpret `ffprobe -print_format json -show_streams -show_format` output
fn parse_probe(json: &[u8]) -> Result<VideoInfo> {
    let parsed: ProbeOut = serde_json::from_slice(json)
        .map_err(|e| Error::Decode(format!("ffprobe json parse failed: {}", e)))?;
    let stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::FormatInvalid("no video stream found".into()))?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| Error::Decode("missing video width from ffprobe".into()))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| Error::Decode("missing video height from ffprobe".into()))?;
    let fps = parse_ff_ratio(stream.r_frame_rate.as_deref().unwrap_or("0/1"))
        .ok_or_else(|| Error::Decode("invalid video r_frame_rate".into()))?;
    let duration_ms = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as u64)
        .unwrap_or(0);

    Ok(VideoInfo {
        width,
        height,
        fps,
        duration_ms,
    })
}

/// Frame source backed by `ffmpeg`/`ffprobe` on the PATH
pub struct FfmpegFrameSource {
    path: PathBuf,
    info: VideoInfo,
    stream: Option<(Child, ChildStdout)>,
    /// Index of the frame the pipe will yield next
    next_index: u64,
    /// First index with no frame, once the stream has been read to its end
    end_index: Option<u64>,
    last: Option<VideoFrame>,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path) -> Result<Self> {
        let out = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()
            .map_err(|e| Error::Decode(format!("failed to run ffprobe: {}", e)))?;
        if !out.status.success() {
            return Err(Error::Decode(format!(
                "ffprobe failed for '{}': {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let info = parse_probe(&out.stdout)?;
        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            duration_ms = info.duration_ms,
            "Opened video"
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            stream: None,
            next_index: 0,
            end_index: None,
            last: None,
        })
    }

    fn restart_at(&mut self, index: u64) -> Result<()> {
        self.stop();

        let start_sec = self.info.frame_position_ms(index) as f64 / 1000.0;
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{:.6}", start_sec)])
            .arg("-i")
            .arg(&self.path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Decode(format!("failed to run ffmpeg for video decode: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Decode("ffmpeg stdout unavailable".into()))?;

        self.stream = Some((child, stdout));
        self.next_index = index;
        Ok(())
    }

    /// Next raw frame, or None at end of stream
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.info.frame_len();
        let (_, stdout) = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Decode("decoder not running".into()))?;
        let mut buf = vec![0u8; len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {
                self.next_index += 1;
                Ok(Some(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::Decode(format!(
                "ffmpeg read failed for '{}': {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn reached_end(&mut self) {
        let end = self.next_index;
        self.end_index = Some(self.end_index.map_or(end, |known| known.min(end)));
        self.stop();
        debug!(path = %self.path.display(), end_index = end, "Video stream ended before declared duration");
    }

    fn stop(&mut self) {
        if let Some((mut child, _)) = self.stream.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn frame_at(&mut self, position_ms: u64) -> Result<Option<VideoFrame>> {
        let target = self.info.frame_index(position_ms);
        if self.end_index.is_some_and(|end| target >= end) {
            return Ok(None);
        }

        // Same frame as last time
        if let Some(last) = &self.last {
            if self.stream.is_some() && target + 1 == self.next_index {
                return Ok(Some(last.clone()));
            }
        }

        let max_skip = self.info.frame_index(MAX_SKIP_MS).max(1);
        if self.stream.is_none() || target < self.next_index || target - self.next_index > max_skip
        {
            self.restart_at(target)?;
        }
        while self.next_index < target {
            if self.read_frame()?.is_none() {
                self.reached_end();
                return Ok(None);
            }
        }

        let Some(data) = self.read_frame()? else {
            self.reached_end();
            return Ok(None);
        };
        let image = RgbaImage::from_raw(self.info.width, self.info.height, data)
            .ok_or_else(|| Error::Decode("decoded frame has wrong size".into()))?;
        let frame = VideoFrame::new(image, self.info.frame_position_ms(target));
        self.last = Some(frame.clone());
        Ok(Some(frame))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens `FfmpegFrameSource`s
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSourceFactory;

impl FrameSourceFactory for FfmpegSourceFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegFrameSource::open(path)?))
    }
}

/// Latest decoder output
#[derive(Debug, Clone, Default)]
pub struct DecodedState {
    pub frame: Option<VideoFrame>,
    pub info: Option<VideoInfo>,
    /// Set once the source fails; no further frames follow
    pub error: Option<String>,
}

/// Background decoder with a single-slot frame mailbox
pub struct FrameDecoder {
    requests: watch::Sender<Option<u64>>,
    output: watch::Receiver<DecodedState>,
    cancel: CancellationToken,
}

impl FrameDecoder {
    /// Open `path` on the worker pool and start decoding from `start_ms`
    pub fn start(
        runtime: &tokio::runtime::Handle,
        factory: Arc<dyn FrameSourceFactory>,
        path: PathBuf,
        start_ms: u64,
    ) -> Self {
        let (requests, request_rx) = watch::channel(Some(start_ms));
        let (output_tx, output) = watch::channel(DecodedState::default());
        let cancel = CancellationToken::new();

        runtime.spawn(decode_loop(factory, path, request_rx, output_tx, cancel.clone()));

        Self {
            requests,
            output,
            cancel,
        }
    }

    /// Ask for the frame at `position_ms`; supersedes earlier requests
    pub fn request(&self, position_ms: u64) {
        let _ = self.requests.send_if_modified(|current| {
            if *current == Some(position_ms) {
                false
            } else {
                *current = Some(position_ms);
                true
            }
        });
    }

    /// Most recently decoded frame, if any
    pub fn latest(&self) -> Option<VideoFrame> {
        self.output.borrow().frame.clone()
    }

    pub fn info(&self) -> Option<VideoInfo> {
        self.output.borrow().info
    }

    pub fn error(&self) -> Option<String> {
        self.output.borrow().error.clone()
    }

    /// Output channel, for awaiting frames outside the render loop
    pub fn subscribe(&self) -> watch::Receiver<DecodedState> {
        self.output.clone()
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn decode_loop(
    factory: Arc<dyn FrameSourceFactory>,
    path: PathBuf,
    mut requests: watch::Receiver<Option<u64>>,
    output: watch::Sender<DecodedState>,
    cancel: CancellationToken,
) {
    let open_path = path.clone();
    let opened = tokio::task::spawn_blocking(move || factory.open(&open_path)).await;
    let mut source = match opened {
        Ok(Ok(source)) => source,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "Failed to open video");
            output.send_modify(|state| state.error = Some(e.to_string()));
            return;
        }
        Err(e) => {
            output.send_modify(|state| state.error = Some(format!("decoder task failed: {}", e)));
            return;
        }
    };
    let info = *source.info();
    output.send_modify(|state| state.info = Some(info));

    loop {
        let wanted = *requests.borrow_and_update();
        if let Some(position_ms) = wanted {
            let decoded = tokio::task::spawn_blocking(move || {
                let result = source.frame_at(position_ms);
                (source, result)
            })
            .await;

            match decoded {
                Ok((returned, Ok(Some(frame)))) => {
                    source = returned;
                    output.send_modify(|state| state.frame = Some(frame));
                }
                Ok((returned, Ok(None))) => {
                    source = returned;
                    trace!(path = %path.display(), position_ms, "No frame past end of stream, keeping last");
                }
                Ok((_, Err(e))) => {
                    warn!(path = %path.display(), position_ms, error = %e, "Video decode failed");
                    output.send_modify(|state| state.error = Some(e.to_string()));
                    return;
                }
                Err(e) => {
                    output.send_modify(|state| {
                        state.error = Some(format!("decoder task failed: {}", e))
                    });
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(path = %path.display(), "Decoder released");
                return;
            }
            changed = requests.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
