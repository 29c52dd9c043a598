//! HTTP request handlers
//!
//! Commands are queued on the controller and acknowledged with 202; their
//! effect shows up on `/state` and the event stream once the render loop
//! applies them.

use crate::api::AppContext;
use crate::cache::CacheStats;
use crate::controller::ControllerCommand;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tphoto_common::events::StateSnapshot;
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

// ============================================================================
// Health / State
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "tphoto-ar".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
    })
}

/// GET /state - latest controller snapshot
pub async fn get_state(State(ctx): State<AppContext>) -> Json<StateSnapshot> {
    Json(ctx.controller.snapshot())
}

/// GET /cache/stats
pub async fn get_cache_stats(
    State(ctx): State<AppContext>,
) -> Result<Json<CacheStats>, ApiError> {
    let Some(cache) = &ctx.cache else {
        return Err(api_error(StatusCode::NOT_FOUND, "no cache configured"));
    };
    match cache.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => {
            error!("Failed to read cache stats: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn queue(ctx: &AppContext, command: ControllerCommand) -> Result<StatusCode, ApiError> {
    info!(?command, "Command received");
    ctx.controller
        .send(command)
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

/// POST /refresh - discard the anchor and rescan
pub async fn refresh(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::RefreshScan)
}

/// POST /pause
pub async fn pause(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::Pause)
}

/// POST /resume
pub async fn resume(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::Resume)
}

/// POST /background - host app moved to the background
pub async fn background(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::Background)
}

/// POST /foreground
pub async fn foreground(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::Foreground)
}

/// POST /release - tear everything down
pub async fn release(State(ctx): State<AppContext>) -> Result<StatusCode, ApiError> {
    queue(&ctx, ControllerCommand::Release)
}
