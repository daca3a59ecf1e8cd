//! `weave validate` and `weave workflow`: check, store and inspect workflow
//! definitions.

use weave_core::engine::StepGraph;
use weave_core::models::{WorkflowDefinition, WorkflowStatus};
use weave_core::state::AppState;

fn load(file: &str) -> Result<WorkflowDefinition, String> {
    WorkflowDefinition::from_file(file).map_err(|e| format!("[{}] {}", e.code(), e))
}

/// Validate a definition file without touching the database. Reports the
/// dispatch order on success.
pub fn validate(file: &str) -> Result<serde_json::Value, String> {
    let definition = load(file)?;
    let graph = StepGraph::build(&definition).map_err(|e| format!("[{}] {}", e.code(), e))?;
    let order: Vec<&str> = graph
        .order()
        .iter()
        .map(|&i| definition.steps[i].id.as_str())
        .collect();
    Ok(serde_json::json!({
        "valid": true,
        "name": definition.name,
        "steps": definition.steps.len(),
        "order": order,
    }))
}

/// Store a definition as a `draft` workflow. A running server executes it
/// on `POST /workflows/{id}/execute`.
pub async fn submit(state: &AppState, file: &str) -> Result<serde_json::Value, String> {
    let definition = load(file)?;
    let workflow = state
        .engine
        .submit(definition)
        .await
        .map_err(|e| format!("[{}] {}", e.code(), e))?;
    tracing::info!("[CLI] Stored draft workflow {} from {}", workflow.id, file);
    Ok(serde_json::json!({
        "workflowId": workflow.id,
        "name": workflow.name,
        "status": workflow.status,
    }))
}

pub async fn get(state: &AppState, workflow_id: &str) -> Result<serde_json::Value, String> {
    let detail = state
        .engine
        .get(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(&detail).map_err(|e| e.to_string())
}

pub async fn list(state: &AppState, status: Option<&str>) -> Result<serde_json::Value, String> {
    let status = match status {
        Some(s) => Some(WorkflowStatus::from_str(s).ok_or_else(|| format!("Invalid status: {}", s))?),
        None => None,
    };
    let workflows = state
        .engine
        .list(status)
        .await
        .map_err(|e| e.to_string())?;
    let rows: Vec<serde_json::Value> = workflows
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "status": w.status,
                "createdAt": w.created_at,
            })
        })
        .collect();
    Ok(serde_json::json!({ "workflows": rows }))
}

/// The journal of one workflow, oldest first.
pub async fn events(state: &AppState, workflow_id: &str) -> Result<serde_json::Value, String> {
    let events = state
        .engine
        .events(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "events": events }))
}
