//! `weave agent`: inspect persisted agent registrations.

use weave_core::state::AppState;

/// Registrations restored from the database, including their last known
/// health.
pub async fn list(state: &AppState) -> Result<serde_json::Value, String> {
    state.registry.load().await.map_err(|e| e.to_string())?;
    let agents = state.registry.list().await;
    Ok(serde_json::json!({ "agents": agents }))
}
