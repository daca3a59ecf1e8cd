use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::ServerError;
use crate::models::{AgentHealth, AgentRegistration, Capability};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents).post(register_agent))
        .route("/{id}", delete(deregister_agent))
        .route("/{id}/heartbeat", post(heartbeat))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAgentsQuery {
    /// Only healthy agents with this capability, best candidates first.
    capability: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let agents = match &query.capability {
        Some(c) => {
            let capability = Capability::from_str(c)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown capability: {}", c)))?;
            state.registry.find_healthy(capability).await
        }
        None => state.registry.list().await,
    };
    Ok(Json(serde_json::json!({ "agents": agents })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAgentRequest {
    agent_id: String,
    capabilities: Vec<String>,
}

async fn register_agent(
    State(state): State<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<Json<AgentRegistration>, ServerError> {
    let capabilities = body
        .capabilities
        .iter()
        .map(|c| {
            Capability::from_str(c)
                .ok_or_else(|| ServerError::BadRequest(format!("Unknown capability: {}", c)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let registration = state.registry.register(&body.agent_id, capabilities).await?;
    Ok(Json(registration))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    health: Option<String>,
}

async fn heartbeat(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    body: Bytes,
) -> Result<Json<AgentRegistration>, ServerError> {
    let request: HeartbeatRequest = super::optional_body(&body)?;
    let health = match &request.health {
        Some(h) => Some(
            AgentHealth::from_str(h)
                .ok_or_else(|| ServerError::BadRequest(format!("Invalid health: {}", h)))?,
        ),
        None => None,
    };
    Ok(Json(state.registry.heartbeat(&id, health).await?))
}

async fn deregister_agent(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.registry.deregister(&id).await? {
        return Err(ServerError::NotFound(format!("Agent {} not registered", id)));
    }
    Ok(Json(serde_json::json!({ "deregistered": true })))
}
