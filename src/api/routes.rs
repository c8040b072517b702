//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ApiState>`.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::catalogue::{FinishedMatch, MatchCatalogue};
use crate::gateway::CredentialCache;
use crate::settlement::{Coordinator, ResultSubmission};
use crate::types::{MatchResult, NewSlip, SettlementError, Slip};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub coordinator: Coordinator,
    pub catalogue: MatchCatalogue,
    /// Present only when gateway credentials are configured.
    pub gateway: Option<CredentialCache>,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by handlers, rendered as `{ "success": false, "error": ... }`.
#[derive(Debug)]
pub enum ApiError {
    Settlement(SettlementError),
    Internal(anyhow::Error),
}

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        ApiError::Settlement(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Settlement(e) => {
                let status = match e {
                    SettlementError::InvalidInput(_) | SettlementError::MalformedChoice { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
                    SettlementError::CommitFailed(_) | SettlementError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        };

        if status.is_server_error() {
            error!(%status, error = %message, "Request failed");
        }

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    pub message: String,
    pub updated_slip_count: usize,
    pub slips_won: usize,
    pub slips_lost: usize,
    pub result: MatchResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishedMatchesResponse {
    pub success: bool,
    pub matches: Vec<FinishedMatch>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub gateway_configured: bool,
    pub gateway_token_fresh: bool,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/admin/update-match-result
pub async fn update_match_result(
    State(state): State<AppState>,
    Json(submission): Json<ResultSubmission>,
) -> Result<Json<SettleResponse>, ApiError> {
    info!(
        match_id = ?submission.match_id,
        score_home = ?submission.score_home,
        score_away = ?submission.score_away,
        "Match result submitted"
    );

    let report = state.coordinator.settle_match(&submission).await?;

    Ok(Json(SettleResponse {
        success: true,
        message: format!(
            "Result recorded and {} slips updated",
            report.updated_slip_count
        ),
        updated_slip_count: report.updated_slip_count,
        slips_won: report.slips_won,
        slips_lost: report.slips_lost,
        result: report.match_result,
    }))
}

/// GET /api/admin/finished-matches
pub async fn finished_matches(
    State(state): State<AppState>,
) -> Result<Json<FinishedMatchesResponse>, ApiError> {
    let settled: HashSet<String> = state
        .coordinator
        .store()
        .match_ids_with_results()
        .await?
        .into_iter()
        .collect();

    Ok(Json(FinishedMatchesResponse {
        success: true,
        matches: state.catalogue.finished_matches(Utc::now(), &settled).await?,
    }))
}

/// GET /api/matches
pub async fn matches(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let doc: Value = state.catalogue.list_matches().await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, private")],
        Json(doc),
    ))
}

/// GET /api/match-results/:match_id
pub async fn get_match_result(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<MatchResult>, ApiError> {
    Ok(Json(state.coordinator.match_result(&match_id).await?))
}

/// POST /api/slips
pub async fn submit_slip(
    State(state): State<AppState>,
    Json(new_slip): Json<NewSlip>,
) -> Result<(StatusCode, Json<Slip>), ApiError> {
    let slip = state.coordinator.submit_slip(new_slip).await?;
    Ok((StatusCode::CREATED, Json(slip)))
}

/// GET /api/slips/:slip_id
pub async fn get_slip(
    State(state): State<AppState>,
    Path(slip_id): Path<String>,
) -> Result<Json<Slip>, ApiError> {
    Ok(Json(state.coordinator.slip(&slip_id).await?))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let gateway_token_fresh = match &state.gateway {
        Some(cache) => cache.is_fresh_at(Utc::now()).await,
        None => false,
    };
    Json(HealthResponse {
        status: "ok",
        gateway_configured: state.gateway.is_some(),
        gateway_token_fresh,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
