use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collector::SnapshotHandle;
use crate::export::{self, HealthMetrics};

/// Shared state for the scrape endpoints.
pub struct ServerState {
    pub snapshot: Arc<SnapshotHandle>,
    pub health: Arc<HealthMetrics>,
    pub metrics_path: String,
    pub expose_hw_counters: bool,
}

/// Serve the metrics, health, and index endpoints until cancelled.
pub async fn serve(
    state: Arc<ServerState>,
    bind: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route(&state.metrics_path, get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/", get(index_handler))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("listening on {bind}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;
    info!(addr = %local_addr, path = %state.metrics_path, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("serving metrics")
}

/// GET <metrics_path> - Prometheus text format built from the published
/// snapshot. The collector never mutates a snapshot after publishing it, so
/// a scrape observes one tick in full.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.health.scrapes_total.inc();

    let snapshot = state.snapshot.load();
    match export::render(&snapshot, &state.health, state.expose_hw_counters) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET / - Index page linking to the metrics path.
async fn index_handler(State(state): State<Arc<ServerState>>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>Energy Attribution Exporter</title></head>\n<body>\n<h1>Energy Attribution Exporter</h1>\n<p><a href=\"{}\">Metrics</a></p>\n</body>\n</html>",
        state.metrics_path,
    ))
}
