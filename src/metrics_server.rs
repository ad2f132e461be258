// HTTP server for Prometheus metrics endpoint
//
// Listens on /metrics endpoint (default: 0.0.0.0:9090)
// Each scrape refreshes the store-state gauges from a dashboard snapshot

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::guard::{DashboardBuilder, Gatekeeper};
use crate::metrics;

/// Routes served by the metrics server
pub fn router(gate: Gatekeeper) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(gate)
}

/// Start the metrics HTTP server
///
/// # Arguments
/// * `port` - Port to listen on (default 9090)
/// * `gate` - Guards whose store state the gauges report
///
/// Expects [`metrics::init`] to have run.
pub async fn start_metrics_server(port: u16, gate: Gatekeeper) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind metrics server")?;

    axum::serve(listener, router(gate))
        .await
        .context("Metrics server error")?;

    Ok(())
}

async fn metrics_handler(State(gate): State<Gatekeeper>) -> Response {
    match DashboardBuilder::new(&gate).build().await {
        Ok(data) => metrics::record_dashboard(&data),
        // Counters are still worth serving when the store is down
        Err(e) => warn!(error = %e, "Failed to refresh store gauges"),
    }

    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
