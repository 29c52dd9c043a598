//! HTTP control surface
//!
//! Exposes the controller's observable state, its event stream and the UI
//! commands (`refresh`, `pause`, `resume`, `release`, plus app lifecycle).

pub mod handlers;
pub mod sse;

use crate::cache::VideoCache;
use crate::controller::ControllerHandle;
use crate::error::{Error, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub controller: ControllerHandle,
    pub cache: Option<Arc<VideoCache>>,
}

/// Build the router
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/state", get(handlers::get_state))
        .route("/events", get(sse::event_stream))
        .route("/cache/stats", get(handlers::get_cache_stats))
        .route("/refresh", post(handlers::refresh))
        .route("/pause", post(handlers::pause))
        .route("/resume", post(handlers::resume))
        .route("/background", post(handlers::background))
        .route("/foreground", post(handlers::foreground))
        .route("/release", post(handlers::release))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the control surface on `port` until `shutdown` resolves
pub async fn serve(
    ctx: AppContext,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
