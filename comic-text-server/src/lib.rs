pub mod config;
pub mod detection;
pub mod error;
pub mod gpu;
pub mod routes;
pub mod state;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub use crate::{
    config::Config,
    detection::{DetectionService, TextBox, TextDetector},
    state::AppState,
};

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(routes::health))
        .route("/detect", post(routes::detect))
        .route("/detect_url", post(routes::detect_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let cuda_available = gpu::cuda_available();
    let options = config.detector_options(cuda_available);
    tracing::info!(
        "CUDA available: {}, using {:?}",
        cuda_available,
        options.device
    );

    let model_path = config.model_path.clone();
    let service = tokio::task::spawn_blocking(move || DetectionService::load(&model_path, options))
        .await
        .context("Detector loading task failed")?;
    tracing::info!("detector backend: {}", service.backend());

    let address = config.bind_address();
    let app = create_app(AppState::new(service, config, cuda_available));

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
