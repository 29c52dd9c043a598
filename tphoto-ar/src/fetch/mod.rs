//! Backend video fetching: REST client, retry policy and the
//! de-duplicating provider

pub mod backend_client;
pub mod provider;
pub mod retry;

pub use backend_client::{
    validate_format, BackendClient, DownloadedVideo, FetcherConfig, JobHandle, VideoResult,
};
pub use provider::{
    FetchResult, FetchStage, FetchTicket, PreparedVideo, VideoOrigin, VideoProvider, VideoSource,
};
pub use retry::{retry_transient, RetryPolicy};
