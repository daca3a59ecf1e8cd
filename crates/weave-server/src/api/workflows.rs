use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::ServerError;
use crate::models::{WorkflowDefinition, WorkflowStatus};
use crate::state::AppState;
use weave_core::engine::WorkflowDetail;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(submit_workflow))
        .route("/validate", post(validate_workflow))
        .route("/{id}", get(get_workflow))
        .route("/{id}/execute", post(execute_workflow))
        .route("/{id}/cancel", post(cancel_workflow))
        .route("/{id}/events", get(list_workflow_events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListWorkflowsQuery {
    status: Option<String>,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let status = match &query.status {
        Some(s) => Some(
            WorkflowStatus::from_str(s)
                .ok_or_else(|| ServerError::BadRequest(format!("Invalid status: {}", s)))?,
        ),
        None => None,
    };
    let workflows = state.engine.list(status).await?;
    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitWorkflowRequest {
    definition: WorkflowDefinition,
    /// Start the workflow right after it is stored.
    #[serde(default)]
    execute: bool,
}

async fn submit_workflow(
    State(state): State<AppState>,
    Json(body): Json<SubmitWorkflowRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    let workflow = state.engine.submit(body.definition).await?;
    let status = if body.execute {
        state.engine.execute(&workflow.id).await?.workflow.status
    } else {
        workflow.status
    };
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "workflowId": workflow.id,
            "status": status,
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateWorkflowRequest {
    definition: WorkflowDefinition,
}

async fn validate_workflow(
    State(state): State<AppState>,
    Json(body): Json<ValidateWorkflowRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let graph = state.engine.validate(&body.definition)?;
    let order: Vec<&str> = graph
        .order()
        .iter()
        .map(|&i| body.definition.steps[i].id.as_str())
        .collect();
    Ok(Json(serde_json::json!({
        "valid": true,
        "order": order,
    })))
}

async fn get_workflow(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<WorkflowDetail>, ServerError> {
    Ok(Json(state.engine.get(&id).await?))
}

async fn execute_workflow(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<WorkflowDetail>, ServerError> {
    Ok(Json(state.engine.execute(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelWorkflowRequest {
    reason: Option<String>,
}

/// The body is optional. Active workflows finish cancelling in the
/// background, so the response is `202 Accepted` unless already final.
async fn cancel_workflow(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<WorkflowDetail>), ServerError> {
    let request: CancelWorkflowRequest = super::optional_body(&body)?;
    let detail = state.engine.cancel(&id, request.reason).await?;
    let code = if detail.workflow.is_finalized() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(detail)))
}

async fn list_workflow_events(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let events = state.engine.events(&id).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}
