//! Lip-sync backend REST client
//!
//! **Endpoints:**
//! - `POST /lipsync/generate {posterId, text, voiceId}` → `{jobId}`
//! - `GET /lipsync/status/{jobId}` → `{status, videoUrl?, lipCoordinates?, checksum?, durationMs?, sizeBytes?}`
//! - `GET {videoUrl}` → raw video bytes
//!
//! Each network stage has its own time budget: one request timeout per
//! `generate` attempt, one overall budget for the poll loop, and one
//! per-chunk budget while downloading.

use crate::checksum;
use crate::error::{Error, Result, Stage};
use crate::fetch::retry::{retry_transient, RetryPolicy};
use crate::model::{LipCoordinates, TalkingPhotoRequest, VideoMeta};
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("tphoto-ar/", env!("CARGO_PKG_VERSION"));

/// Container formats accepted for playback
const ACCEPTED_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/webm",
    "video/x-matroska",
];

/// Upper bound on up-front buffer allocation from a declared size
const MAX_PREALLOC_BYTES: u64 = 64 * 1024 * 1024;

/// Backend endpoint and time budgets
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    /// Per-request budget for generate and status calls
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Overall budget for the poll loop
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    /// Maximum wait for the next chunk of a download
    pub chunk_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(180),
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(15),
        }
    }
}

/// Submitted generation job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

/// Completed job payload
#[derive(Debug, Clone, PartialEq)]
pub struct VideoResult {
    /// Absolute download URL
    pub video_url: Url,
    pub checksum: String,
    pub size_bytes: Option<u64>,
    pub meta: VideoMeta,
}

/// Verified download
#[derive(Debug, Clone)]
pub struct DownloadedVideo {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: JobStatus,
    video_url: Option<String>,
    lip_coordinates: Option<serde_json::Value>,
    checksum: Option<String>,
    duration_ms: Option<u64>,
    size_bytes: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Interpreted status poll
#[derive(Debug, Clone, PartialEq)]
enum JobOutcome {
    Pending(JobStatus),
    Completed(VideoResult),
    Failed(String),
}

/// Validate a status payload; `base` resolves relative video URLs
fn parse_status(body: &str, base: &Url) -> Result<JobOutcome> {
    let response: StatusResponse = serde_json::from_str(body)
        .map_err(|e| Error::FormatInvalid(format!("malformed status response: {}", e)))?;

    match response.status {
        JobStatus::Queued | JobStatus::Processing => Ok(JobOutcome::Pending(response.status)),
        JobStatus::Failed => Ok(JobOutcome::Failed(
            response
                .error
                .unwrap_or_else(|| "backend reported failure".to_string()),
        )),
        JobStatus::Completed => {
            let video_url = response
                .video_url
                .ok_or_else(|| Error::FormatInvalid("completed job without videoUrl".into()))?;
            let video_url = base
                .join(&video_url)
                .map_err(|e| Error::FormatInvalid(format!("invalid videoUrl {}: {}", video_url, e)))?;

            let checksum = response
                .checksum
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| Error::FormatInvalid("completed job without checksum".into()))?;

            let lip = response
                .lip_coordinates
                .ok_or_else(|| Error::FormatInvalid("completed job without lipCoordinates".into()))?;
            let lip: LipCoordinates = serde_json::from_value(lip)
                .map_err(|e| Error::FormatInvalid(format!("invalid lipCoordinates: {}", e)))?;

            Ok(JobOutcome::Completed(VideoResult {
                video_url,
                checksum: checksum.trim().to_string(),
                size_bytes: response.size_bytes,
                meta: VideoMeta {
                    lip,
                    duration_ms: response.duration_ms,
                },
            }))
        }
    }
}

/// Sniff the container format of downloaded bytes
pub fn validate_format(bytes: &[u8]) -> Result<&'static str> {
    match infer::get(bytes) {
        Some(kind) if ACCEPTED_MIME_TYPES.contains(&kind.mime_type()) => Ok(kind.mime_type()),
        Some(kind) => Err(Error::FormatInvalid(format!(
            "unsupported media type {}",
            kind.mime_type()
        ))),
        None => Err(Error::FormatInvalid("unrecognized media type".into())),
    }
}

/// Map a non-success HTTP status onto the error taxonomy
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(Error::BackendUnavailable(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body
        )))
    } else {
        Err(Error::BackendRejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

fn transport_error(err: reqwest::Error, stage: Stage, started: Instant) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            stage,
            elapsed: started.elapsed(),
        }
    } else {
        Error::from(err)
    }
}

/// Lip-sync backend client
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    config: FetcherConfig,
}

impl BackendClient {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid backend URL {}: {}", config.base_url, e)))?;
        // Joined paths must extend the base path, not replace its last segment
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("bad endpoint {}: {}", path, e)))
    }

    /// Submit a generation job, retrying transient failures
    pub async fn generate(&self, request: &TalkingPhotoRequest) -> Result<JobHandle> {
        retry_transient("generate", &self.config.retry, || self.generate_once(request)).await
    }

    async fn generate_once(&self, request: &TalkingPhotoRequest) -> Result<JobHandle> {
        let url = self.endpoint("lipsync/generate")?;
        let started = Instant::now();

        debug!(poster_id = %request.poster_id, url = %url, "Submitting generation job");

        let response = self
            .http
            .post(url)
            .timeout(self.config.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, Stage::Generate, started))?;
        let response = check_status(response).await?;

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, Stage::Generate, started))?;
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| Error::FormatInvalid(format!("malformed generate response: {}", e)))?;
        if parsed.job_id.trim().is_empty() {
            return Err(Error::FormatInvalid("empty jobId".into()));
        }

        info!(
            poster_id = %request.poster_id,
            job_id = %parsed.job_id,
            "Generation job submitted"
        );

        Ok(JobHandle {
            job_id: parsed.job_id,
        })
    }

    /// Poll job status until it completes, fails, or the poll budget runs out
    pub async fn poll_until_complete(&self, handle: &JobHandle) -> Result<VideoResult> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.poll_timeout, self.poll_loop(handle)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %handle.job_id, "Generation job did not finish in time");
                Err(Error::Timeout {
                    stage: Stage::Poll,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn poll_loop(&self, handle: &JobHandle) -> Result<VideoResult> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.status_once(handle).await {
                Ok(JobOutcome::Pending(status)) => {
                    debug!(job_id = %handle.job_id, status = ?status, "Generation in progress");
                }
                Ok(JobOutcome::Completed(result)) => {
                    info!(
                        job_id = %handle.job_id,
                        video_url = %result.video_url,
                        "Generation job completed"
                    );
                    return Ok(result);
                }
                Ok(JobOutcome::Failed(message)) => {
                    warn!(job_id = %handle.job_id, message = %message, "Generation job failed");
                    return Err(Error::GenerationFailed(message));
                }
                Err(e) if e.is_transient() => {
                    // Covered by the overall poll budget
                    warn!(job_id = %handle.job_id, error = %e, "Status poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn status_once(&self, handle: &JobHandle) -> Result<JobOutcome> {
        let url = self.endpoint(&format!("lipsync/status/{}", handle.job_id))?;
        let started = Instant::now();

        let response = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, Stage::Poll, started))?;
        let response = check_status(response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, Stage::Poll, started))?;

        parse_status(&body, &self.base_url)
    }

    /// Download and verify a generated video
    ///
    /// The digest is computed while streaming; a mismatch with
    /// `expected_checksum` or with `expected_size` is a `DownloadError` and
    /// the partial data is dropped. Transient failures are retried; the
    /// container format is checked once the bytes are verified.
    pub async fn download(
        &self,
        url: &Url,
        expected_checksum: &str,
        expected_size: Option<u64>,
    ) -> Result<DownloadedVideo> {
        let mut video = retry_transient("download", &self.config.retry, || {
            self.download_once(url, expected_checksum, expected_size)
        })
        .await?;

        video.mime_type = validate_format(&video.bytes)?;

        info!(
            url = %url,
            size_bytes = video.bytes.len(),
            mime_type = video.mime_type,
            "Video downloaded and verified"
        );
        Ok(video)
    }

    async fn download_once(
        &self,
        url: &Url,
        expected_checksum: &str,
        expected_size: Option<u64>,
    ) -> Result<DownloadedVideo> {
        let started = Instant::now();
        let chunk_timeout = self.config.chunk_timeout;
        let timed_out = |started: Instant| Error::Timeout {
            stage: Stage::Download,
            elapsed: started.elapsed(),
        };

        let response = tokio::time::timeout(chunk_timeout, self.http.get(url.clone()).send())
            .await
            .map_err(|_| timed_out(started))?
            .map_err(|e| transport_error(e, Stage::Download, started))?;
        let response = check_status(response).await?;

        let capacity = expected_size.unwrap_or(0).min(MAX_PREALLOC_BYTES) as usize;
        let mut bytes = Vec::with_capacity(capacity);
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::time::timeout(chunk_timeout, stream.next())
                .await
                .map_err(|_| timed_out(started))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                Error::DownloadError(format!(
                    "transfer interrupted after {} bytes: {}",
                    bytes.len(),
                    e
                ))
            })?;

            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);

            if let Some(expected) = expected_size {
                if bytes.len() as u64 > expected {
                    return Err(Error::DownloadError(format!(
                        "transfer exceeds declared size of {} bytes",
                        expected
                    )));
                }
            }
        }

        if let Some(expected) = expected_size {
            if bytes.len() as u64 != expected {
                return Err(Error::DownloadError(format!(
                    "truncated transfer: got {} of {} bytes",
                    bytes.len(),
                    expected
                )));
            }
        }

        let actual = format!("{:x}", hasher.finalize());
        if !checksum::matches(expected_checksum, &actual) {
            return Err(Error::DownloadError(format!(
                "checksum mismatch: expected {}, got {}",
                expected_checksum, actual
            )));
        }

        Ok(DownloadedVideo {
            bytes,
            checksum: actual,
            mime_type: "",
        })
    }
}
