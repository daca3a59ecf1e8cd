use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::ServerError;
use crate::models::InvocationContext;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tools))
        .route("/health", get(check_health))
        .route("/{capability}/invoke", post(invoke_tool))
        .route("/{capability}/invocations", get(list_invocations))
}

/// Every registered adapter with its circuit state and current score.
async fn list_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools = state.tools.status().await;
    Json(serde_json::json!({ "tools": tools }))
}

async fn check_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools = state.tools.health_check_all().await;
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeToolRequest {
    #[serde(default)]
    args: serde_json::Value,
    #[serde(flatten)]
    context: InvocationContext,
}

async fn invoke_tool(
    State(state): State<AppState>,
    axum::extract::Path(capability): axum::extract::Path<String>,
    Json(body): Json<InvokeToolRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let result = state
        .tools
        .invoke(&capability, body.args, &body.context)
        .await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationsQuery {
    limit: Option<usize>,
}

async fn list_invocations(
    State(state): State<AppState>,
    axum::extract::Path(capability): axum::extract::Path<String>,
    Query(query): Query<InvocationsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let invocations = state.tools.history(&capability, limit).await?;
    Ok(Json(serde_json::json!({ "invocations": invocations })))
}
