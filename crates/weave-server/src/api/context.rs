use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::ServerError;
use crate::models::{ContextLayer, ContextScope};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(read_context).post(write_context))
        .route("/history", get(context_history))
        .route("/snapshot", get(snapshot))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadContextQuery {
    /// Storage key of the scope, e.g. `step/payments/wf-1/build`.
    scope: String,
    key: Option<String>,
    as_of: Option<u64>,
}

/// With `key`, the most specific visible version of that key. Without it,
/// every key written at exactly this scope.
async fn read_context(
    State(state): State<AppState>,
    Query(query): Query<ReadContextQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let scope = ContextScope::parse(&query.scope)?;
    match &query.key {
        Some(key) => {
            let layer = state
                .context
                .read(&scope, key, query.as_of)
                .await?
                .ok_or_else(|| {
                    ServerError::NotFound(format!("Context key {} not found at {}", key, scope))
                })?;
            Ok(Json(serde_json::json!({ "layer": layer })))
        }
        None => {
            let layers = state.context.list(&scope).await?;
            Ok(Json(serde_json::json!({ "layers": layers })))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteContextRequest {
    scope: String,
    key: String,
    value: serde_json::Value,
    writer_id: Option<String>,
}

async fn write_context(
    State(state): State<AppState>,
    Json(body): Json<WriteContextRequest>,
) -> Result<Json<ContextLayer>, ServerError> {
    let scope = ContextScope::parse(&body.scope)?;
    let writer = body.writer_id.as_deref().unwrap_or("api");
    let layer = state
        .context
        .write(&scope, &body.key, body.value, writer)
        .await?;
    Ok(Json(layer))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    scope: String,
    key: String,
}

async fn context_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let scope = ContextScope::parse(&query.scope)?;
    let history = state.context.history(&scope, &query.key).await?;
    Ok(Json(serde_json::json!({ "history": history })))
}

/// Current commit sequence, usable as `asOf` for repeatable reads.
async fn snapshot(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ServerError> {
    let as_of = state.context.snapshot().await?;
    Ok(Json(serde_json::json!({ "asOf": as_of })))
}
