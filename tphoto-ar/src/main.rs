//! Talking Photo AR (tphoto-ar) - replay harness entry point
//!
//! Drives the talking-photo controller at 60 Hz from a recorded AR trace,
//! compositing onto a synthetic camera background, while serving the HTTP
//! control surface. Videos are generated by the configured lip-sync backend
//! and cached under the root folder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use image::{Rgba, RgbaImage};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tphoto_ar::api::{self, AppContext};
use tphoto_ar::cache::VideoCache;
use tphoto_ar::config::Settings;
use tphoto_ar::controller::{ControllerCommand, TalkingPhotoController};
use tphoto_ar::fetch::{BackendClient, VideoProvider};
use tphoto_ar::render::FfmpegSourceFactory;
use tphoto_ar::tracking::replay::{load_catalog, load_trace};
use tphoto_ar::tracking::{AnchorTracker, ArFrame, ReplaySession, Viewport};
use tphoto_common::config::{resolve_root_folder, TomlConfig};

/// Host frame cadence
const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

/// Frames between PNG snapshots
const SNAPSHOT_EVERY: usize = 60;

/// Command-line arguments for tphoto-ar
#[derive(Parser, Debug)]
#[command(name = "tphoto-ar")]
#[command(about = "Talking photo AR replay harness")]
#[command(version)]
struct Args {
    /// Root folder holding the video cache
    #[arg(short, long, env = "TPHOTO_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Lip-sync backend base URL (overrides the config file)
    #[arg(long, env = "TPHOTO_BACKEND_URL")]
    backend_url: Option<String>,

    /// Explicit config file
    #[arg(short, long, env = "TPHOTO_CONFIG")]
    config: Option<PathBuf>,

    /// Control surface port
    #[arg(short, long, default_value = "5750", env = "TPHOTO_PORT")]
    port: u16,

    /// Recorded AR trace (one JSON frame per line)
    #[arg(long, env = "TPHOTO_TRACE")]
    trace: PathBuf,

    /// Poster catalog (JSON)
    #[arg(long, env = "TPHOTO_CATALOG")]
    catalog: PathBuf,

    /// Directory for periodic composited PNG snapshots
    #[arg(long, env = "TPHOTO_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tphoto_ar=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        "Starting tphoto-ar v{} ({}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let toml_config =
        TomlConfig::load_or_default(args.config.as_deref()).context("Failed to load config")?;
    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    info!("Root folder: {}", root_folder.display());

    let mut settings =
        Settings::from_toml(&toml_config, &root_folder).context("Invalid configuration")?;
    if let Some(url) = &args.backend_url {
        settings.fetcher.base_url = url.clone();
    }

    let cache = Arc::new(
        VideoCache::open(settings.cache.clone())
            .await
            .context("Failed to open video cache")?,
    );
    let client = Arc::new(
        BackendClient::new(settings.fetcher.clone()).context("Failed to create backend client")?,
    );
    let provider = Arc::new(VideoProvider::new(Arc::clone(&cache), client));

    let catalog = load_catalog(&args.catalog)
        .with_context(|| format!("Failed to load catalog {}", args.catalog.display()))?;
    let trace = load_trace(&args.trace)
        .with_context(|| format!("Failed to load trace {}", args.trace.display()))?;
    info!(
        posters = catalog.posters.len(),
        frames = trace.len(),
        "Replay inputs loaded"
    );

    let tracker = AnchorTracker::new(Box::new(ReplaySession::default()), settings.tracker.clone());
    let mut controller = TalkingPhotoController::new(
        tracker,
        provider,
        Arc::new(catalog.dialogue),
        Arc::new(FfmpegSourceFactory),
        tokio::runtime::Handle::current(),
        settings.render,
    );
    controller
        .initialize(&catalog.posters)
        .context("Failed to register posters")?;

    let shutdown = CancellationToken::new();
    let ctx = AppContext {
        controller: controller.handle(),
        cache: Some(Arc::clone(&cache)),
    };
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(api::serve(ctx, args.port, async move {
        server_shutdown.cancelled().await
    }));

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let render_shutdown = shutdown.clone();
    let snapshot_dir = args.snapshot_dir.clone();
    std::thread::Builder::new()
        .name("render-loop".to_string())
        .spawn(move || {
            run_render_loop(controller, trace, snapshot_dir.as_deref(), &render_shutdown);
            let _ = done_tx.send(());
        })
        .context("Failed to start render loop")?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = done_rx => info!("Trace finished"),
    }
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server stopped with error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
    }

    let stats = cache.stats().await.context("Failed to read cache stats")?;
    info!(
        entries = stats.entries,
        total_bytes = stats.total_bytes,
        hits = stats.hits,
        misses = stats.misses,
        "Shutdown complete"
    );
    Ok(())
}

/// Replay `trace` at the host cadence until it ends or shutdown is requested
fn run_render_loop(
    mut controller: TalkingPhotoController,
    trace: Vec<ArFrame>,
    snapshot_dir: Option<&Path>,
    shutdown: &CancellationToken,
) {
    let mut background: Option<RgbaImage> = None;
    let mut next_deadline = Instant::now();

    for (index, frame) in trace.iter().enumerate() {
        if shutdown.is_cancelled() {
            break;
        }

        let viewport = frame.camera.viewport;
        if background.as_ref().map(|img| img.dimensions())
            != Some((viewport.width, viewport.height))
        {
            background = Some(camera_background(viewport));
        }
        let mut image = match &background {
            Some(img) => img.clone(),
            None => camera_background(viewport),
        };

        let report = controller.on_frame(frame, &mut image);

        if let (Some(dir), Some(_)) = (snapshot_dir, report.overlay) {
            if index % SNAPSHOT_EVERY == 0 {
                let path = dir.join(format!("frame_{:08}.png", frame.timestamp_ms));
                if let Err(e) = image.save(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to write snapshot");
                }
            }
        }

        next_deadline += FRAME_INTERVAL;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            // Running behind; do not try to catch up
            next_deadline = now;
        }
    }

    controller.apply(ControllerCommand::Release);
    info!(snapshot = ?controller.snapshot(), "Render loop stopped");
}

/// Synthetic camera image: a soft vertical gradient
fn camera_background(viewport: Viewport) -> RgbaImage {
    let height = viewport.height.max(1);
    RgbaImage::from_fn(viewport.width, viewport.height, |_, y| {
        let shade = (60 + 120 * y / height) as u8;
        Rgba([shade, shade, shade.saturating_add(20), 255])
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
