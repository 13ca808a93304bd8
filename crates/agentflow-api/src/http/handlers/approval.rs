//! Approval handlers: pending inbox, lookup, and responses.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentflow_types::approval::{ApprovalDecision, ApprovalRequest};

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of `POST /approvals/{id}/respond`.
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub approval: ApprovalRequest,
    /// True when this response resolved the request and the parked
    /// execution was signalled.
    pub resumed: bool,
}

/// Build the approval sub-router. Mounted at `/api/v1`.
pub fn approval_routes() -> Router<AppState> {
    Router::new()
        .route("/approvals/pending", get(list_pending))
        .route("/approvals/{id}", get(get_approval))
        .route("/approvals/{id}/respond", post(respond))
}

/// GET /api/v1/approvals/pending - Requests the caller can still answer.
pub async fn list_pending(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<Vec<ApprovalRequest>>>, AppError> {
    let timer = RequestTimer::start();
    let pending = state.gate().list_pending_for_user(&auth.0).await?;
    Ok(Json(timer.respond(pending).with_link("self", "/api/v1/approvals/pending")))
}

/// GET /api/v1/approvals/{id}
pub async fn get_approval(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalRequest>>, AppError> {
    let timer = RequestTimer::start();
    let request = state.gate().get(id).await?;
    let execution = format!("/api/v1/executions/{}", request.execution_id);
    Ok(Json(timer.respond(request).with_link("execution", &execution)))
}

/// POST /api/v1/approvals/{id}/respond - Approve or reject as the caller.
pub async fn respond(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<RespondRequest>,
) -> Result<Json<ApiResponse<RespondResponse>>, AppError> {
    let timer = RequestTimer::start();
    let comment = body.comment.filter(|c| !c.trim().is_empty());
    let outcome = state.gate().respond(id, &auth.0, body.decision, comment).await?;

    let execution = format!("/api/v1/executions/{}", outcome.request.execution_id);
    let resp = timer
        .respond(RespondResponse {
            approval: outcome.request,
            resumed: outcome.resumed,
        })
        .with_link("execution", &execution);
    Ok(Json(resp))
}
