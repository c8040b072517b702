//! HTTP boundary: Axum server exposing settlement, slips and the catalogue.
//!
//! CORS is open so the browser front-end can be served from anywhere.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use routes::{ApiState, AppState};

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION]);

    Router::new()
        // Admin
        .route("/api/admin/update-match-result", post(routes::update_match_result))
        .route("/api/admin/finished-matches", get(routes::finished_matches))
        // Public
        .route("/api/matches", get(routes::matches))
        .route("/api/match-results/:match_id", get(routes::get_match_result))
        .route("/api/slips", post(routes::submit_slip))
        .route("/api/slips/:slip_id", get(routes::get_slip))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
