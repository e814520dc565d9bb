use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::state::StatusResponse;

/// Latest snapshot published by the tick loop.
pub type StatusRx = watch::Receiver<StatusResponse>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(status: StatusRx) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(status)
}

async fn api_status(State(status): State<StatusRx>) -> impl IntoResponse {
    let snapshot = status.borrow().clone();
    Json(snapshot)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(port: u16, status: StatusRx) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(status))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
