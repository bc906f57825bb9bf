use crate::cli::ServeArgs;
use crate::pipeline::detection::ModelDetector;
use crate::pipeline::registry::{run_evictor, JobRegistry};
use crate::video::OpencvBackend;
use crate::web::api::{cancel_job, get_progress, processing_page, upload_form, upload_video, video_feed};
use crate::web::assets::static_handler;
use crate::web::download::download_video;
use crate::web::state::{AppState, ServerConfig};
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(upload_form).post(upload_video))
        .route("/processing/:filename", get(processing_page))
        .route("/progress/:filename", get(get_progress))
        .route("/cancel/:filename", post(cancel_job))
        .route("/video_feed/:filename", get(video_feed))
        .route("/download/:filename", get(download_video))
        .route("/static/*path", get(static_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::from(&args);
    for dir in [&config.upload_root, &config.output_root] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    info!("Loading detection model from {}", args.model.model);
    let detector = ModelDetector::new(&args.model.model, args.model.min_confidence)?;

    let registry = Arc::new(JobRegistry::new(Duration::from_secs(args.job_ttl_secs)));
    tokio::spawn(run_evictor(
        registry.clone(),
        config.output_root.clone(),
        Duration::from_secs(args.eviction_interval_secs.max(1)),
    ));

    let state = AppState::new(config, registry, Arc::new(OpencvBackend), Arc::new(detector));

    let mut current_port = args.port;
    let listener = loop {
        let addr = SocketAddr::new(args.host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before handing it to tokio
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Clip detector server started on http://{}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, router(state)).await?;

    Ok(())
}
