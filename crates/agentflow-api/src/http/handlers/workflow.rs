//! Workflow definition and execution handlers for the REST API.
//!
//! Endpoints for registering and validating definitions, starting runs, and
//! inspecting execution records with their per-step results.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use agentflow_core::repository::WorkflowRepository;
use agentflow_core::workflow::definition::{DefinitionError, ValidationWarning, validate_definition};
use agentflow_types::execution::Execution;
use agentflow_types::workflow::{StoredWorkflow, WorkflowDefinition};

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::extractors::query::{ExecutionListQuery, WorkflowListQuery};
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::{AppState, RegisteredWorkflow};

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /workflows/{id}/execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: String,
    /// Merged over the definition's initial context.
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Outcome of `POST /workflows/validate`.
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<ValidationWarning>,
    /// Valid but not runnable until every agent step is bound.
    pub draft: bool,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the workflow sub-router. Mounted at `/api/v1`.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/validate", post(validate_workflow))
        .route("/workflows/{id}", get(get_workflow).delete(delete_workflow))
        .route("/workflows/{id}/execute", post(execute_workflow))
        .route("/workflows/{id}/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
}

fn parse_body(body: Value) -> Result<WorkflowDefinition, AppError> {
    serde_json::from_value(body).map_err(|e| AppError::Definition(DefinitionError::Parse(e.to_string())))
}

// ---------------------------------------------------------------------------
// Definition handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Validate and store a definition.
pub async fn create_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<RegisteredWorkflow>>, AppError> {
    let timer = RequestTimer::start();
    let def = parse_body(body)?;
    let registered = state.register_workflow(&def, Some(auth.user_id())).await?;

    let resp = timer
        .respond(registered)
        .with_link("self", &format!("/api/v1/workflows/{}", def.id))
        .with_link("execute", &format!("/api/v1/workflows/{}/execute", def.id));
    Ok(Json(resp))
}

/// GET /api/v1/workflows - List definitions, optionally by owner.
pub async fn list_workflows(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<WorkflowListQuery>,
) -> Result<Json<ApiResponse<Vec<StoredWorkflow>>>, AppError> {
    let timer = RequestTimer::start();
    let defs = state.workflows.list_definitions(query.owner.as_deref()).await?;
    Ok(Json(timer.respond(defs).with_link("self", "/api/v1/workflows")))
}

/// POST /api/v1/workflows/validate - Check a definition without storing it.
///
/// Invalid definitions are reported in the body with `valid: false`, not
/// as an error status.
pub async fn validate_workflow(
    _auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<ValidationReport>>, AppError> {
    let timer = RequestTimer::start();
    let report = match parse_body(body) {
        Ok(def) => match validate_definition(&def) {
            Ok(warnings) => ValidationReport {
                valid: true,
                error: None,
                warnings,
                draft: def.has_unbound_agents(),
            },
            Err(e) => invalid_report(e.to_string()),
        },
        Err(e) => invalid_report(e.to_string()),
    };
    Ok(Json(timer.respond(report)))
}

fn invalid_report(error: String) -> ValidationReport {
    ValidationReport {
        valid: false,
        error: Some(error),
        warnings: Vec::new(),
        draft: false,
    }
}

/// GET /api/v1/workflows/{id} - Get a stored definition.
pub async fn get_workflow(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StoredWorkflow>>, AppError> {
    let timer = RequestTimer::start();
    let stored = state
        .workflows
        .get_definition(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow '{id}' not found")))?;

    let resp = timer
        .respond(stored)
        .with_link("self", &format!("/api/v1/workflows/{id}"))
        .with_link("executions", &format!("/api/v1/workflows/{id}/executions"));
    Ok(Json(resp))
}

/// DELETE /api/v1/workflows/{id} - Delete a definition and its schedules.
pub async fn delete_workflow(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    if !state.delete_workflow(&id).await? {
        return Err(AppError::NotFound(format!("workflow '{id}' not found")));
    }
    Ok(Json(timer.respond(serde_json::json!({"deleted": true, "id": id}))))
}

// ---------------------------------------------------------------------------
// Execution handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/{id}/execute - Run until completion, failure, or
/// suspension on an approval step.
pub async fn execute_workflow(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .executor
        .execute(&id, &request.input, Some(auth.user_id()), request.context)
        .await?;

    let href = format!("/api/v1/executions/{}", execution.id);
    Ok(Json(timer.respond(execution).with_link("self", &href)))
}

/// GET /api/v1/workflows/{id}/executions - Recent executions, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, AppError> {
    let timer = RequestTimer::start();
    let executions = state.workflows.list_executions(&id, query.capped_limit()).await?;
    Ok(Json(timer.respond(executions)))
}

/// GET /api/v1/executions/{id} - One execution record.
pub async fn get_execution(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .workflows
        .get_execution(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
    Ok(Json(timer.respond(execution)))
}
