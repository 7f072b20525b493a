//! Minimal HTTP server exposing Prometheus metrics and a health probe.

use axum::{Router, routing::get};
use tracing::{error, info};

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Run the metrics/health HTTP server on the given port.
pub async fn run_http_server(port: u16) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler));

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "HTTP server listening");

    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server error");
            }
        }
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind HTTP server");
        }
    }
}
