//! Liveness endpoint: answers 200 once the first sync has published,
//! 503 before that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use eyre::{Context, Result};
use tracing::info;

async fn ready_probe(State(ready): State<Arc<AtomicBool>>) -> Response {
    if ready.load(Ordering::Relaxed) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "repo is not ready").into_response()
    }
}

/// Serve the probe on `bind` until the process exits.
pub async fn serve(bind: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let app = Router::new().route("/", get(ready_probe)).with_state(ready);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("can't bind HTTP endpoint {bind}"))?;
    info!(endpoint = bind, "serving HTTP");
    axum::serve(listener, app)
        .await
        .wrap_err("HTTP server terminated")?;
    Ok(())
}
