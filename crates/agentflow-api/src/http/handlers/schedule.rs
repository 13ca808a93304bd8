//! Schedule handlers: cron-triggered runs of stored workflows.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use uuid::Uuid;

use agentflow_core::repository::WorkflowRepository;
use agentflow_core::workflow::schedule::{NewSchedule, ScheduleUpdate};
use agentflow_types::schedule::ScheduleRecord;

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::extractors::query::ScheduleListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Build the schedule sub-router. Mounted at `/api/v1`.
pub fn schedule_routes() -> Router<AppState> {
    Router::new()
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/schedules/{id}",
            get(get_schedule).patch(update_schedule).delete(delete_schedule),
        )
}

/// POST /api/v1/schedules - Create a schedule owned by the caller.
///
/// If the durable substrate is unreachable the row is still stored, in
/// `pending_sync`, and a later reconciliation pass registers it.
pub async fn create_schedule(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<NewSchedule>,
) -> Result<Json<ApiResponse<ScheduleRecord>>, AppError> {
    let timer = RequestTimer::start();
    if !state.workflows.exists(&body.workflow_id).await? {
        return Err(AppError::NotFound(format!(
            "workflow '{}' not found",
            body.workflow_id
        )));
    }
    let record = state.schedules.create(auth.user_id(), body).await?;

    let href = format!("/api/v1/schedules/{}", record.id);
    Ok(Json(timer.respond(record).with_link("self", &href)))
}

/// GET /api/v1/schedules?workflow_id=&owner=
pub async fn list_schedules(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ScheduleListQuery>,
) -> Result<Json<ApiResponse<Vec<ScheduleRecord>>>, AppError> {
    let timer = RequestTimer::start();
    let mut records = match query.workflow_id.as_deref() {
        Some(workflow_id) => state.schedules.get_by_workflow(workflow_id).await?,
        None => state.schedules.list(query.owner.as_deref()).await?,
    };
    if let (Some(_), Some(owner)) = (&query.workflow_id, &query.owner) {
        records.retain(|r| &r.owner == owner);
    }
    Ok(Json(timer.respond(records).with_link("self", "/api/v1/schedules")))
}

/// GET /api/v1/schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ScheduleRecord>>, AppError> {
    let timer = RequestTimer::start();
    let record = state.schedules.get(id).await?;
    Ok(Json(timer.respond(record)))
}

/// PATCH /api/v1/schedules/{id} - Change timing, input, or enable/disable.
pub async fn update_schedule(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<ScheduleUpdate>,
) -> Result<Json<ApiResponse<ScheduleRecord>>, AppError> {
    let timer = RequestTimer::start();
    let record = state.schedules.update(id, body).await?;
    Ok(Json(timer.respond(record)))
}

/// DELETE /api/v1/schedules/{id} - Deregister, then delete the row.
pub async fn delete_schedule(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    state.schedules.delete(id).await?;
    Ok(Json(timer.respond(serde_json::json!({"deleted": true, "id": id}))))
}
