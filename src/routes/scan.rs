use axum::{Json, Router, extract::State, http::StatusCode, routing::post};

use crate::{
    dto::{
        scan::{BatchRequest, BatchSubmissionResponse, ScanRequest, ScanResponse},
        session::TransactionSummary,
    },
    error::{AppError, ServiceError},
    services::{batch_service, transaction_service},
    state::SharedState,
};

/// Scan submission endpoints used by devices without a live socket.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/api/scan", post(submit_scan))
        .route("/api/scan/batch", post(submit_batch))
}

/// Submit a single token scan.
#[utoipa::path(
    post,
    path = "/api/scan",
    tag = "scans",
    request_body = ScanRequest,
    responses(
        (status = 200, description = "Scan processed (accepted, duplicate or rejected)", body = ScanResponse),
        (status = 400, description = "Malformed scan"),
        (status = 503, description = "Server still starting")
    )
)]
pub async fn submit_scan(
    State(state): State<SharedState>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    state.ensure_accepting().await.map_err(ServiceError::from)?;
    let outcome = transaction_service::process_scan(&state, payload).await?;
    Ok(Json(ScanResponse {
        transaction: TransactionSummary::from(&outcome.transaction),
        team_score: outcome.team_score,
    }))
}

/// Submit a batch of scans collected offline.
///
/// Resubmitting a batch id returns the cached result without reapplying it.
#[utoipa::path(
    post,
    path = "/api/scan/batch",
    tag = "scans",
    request_body = BatchRequest,
    responses(
        (status = 202, description = "Batch reconciled", body = BatchSubmissionResponse),
        (status = 400, description = "Malformed batch"),
        (status = 409, description = "No active session")
    )
)]
pub async fn submit_batch(
    State(state): State<SharedState>,
    Json(payload): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchSubmissionResponse>), AppError> {
    state.ensure_accepting().await.map_err(ServiceError::from)?;
    let response = batch_service::submit_batch(&state, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
