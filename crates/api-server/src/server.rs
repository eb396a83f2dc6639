//! Router assembly and the metrics exporter.

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rest::{self, AppState};

/// Assemble the HTTP application.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let tracking_routes = Router::new()
        .route("/track", post(rest::handle_track))
        .route("/pixel.gif", get(rest::handle_pixel_gif))
        .with_state(state.clone());

    let ops_routes = Router::new()
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .with_state(state);

    Router::new()
        .merge(tracking_routes)
        .merge(ops_routes)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the Prometheus exporter on its own port.
pub fn start_metrics(host: &str, port: u16) -> anyhow::Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let handle = builder
        .with_http_listener(SocketAddr::new(host.parse()?, port))
        .install_recorder()?;

    info!(port = port, "metrics exporter started");

    // Keep the recorder alive for the process lifetime.
    std::mem::forget(handle);
    Ok(())
}
