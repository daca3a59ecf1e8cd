//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the weave-core services through `AppState`.

pub mod agent;
pub mod server;
pub mod workflow;

use std::sync::Arc;

use weave_core::state::{AppState, AppStateInner};
use weave_core::{Database, EngineConfig};

/// Load the engine configuration from `--config`, or use the defaults.
pub fn load_config(config_path: Option<&str>) -> Result<EngineConfig, String> {
    weave_server::load_engine_config(config_path)
}

/// Open the database and build the services without starting them.
///
/// Offline commands only read or store drafts. Supervising workflows and
/// resuming interrupted ones is the server's job, so nothing is spawned here.
pub fn init_state(db_path: &str, config: EngineConfig) -> Result<AppState, String> {
    config.validate().map_err(|e| e.to_string())?;
    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;
    Ok(Arc::new(AppStateInner::new(db, config)))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
