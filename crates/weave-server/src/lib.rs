//! Weave Server - HTTP adapter for the workflow orchestration core.
//!
//! Exposes the `weave-core` services over a JSON API via axum:
//! - workflow submission, execution, cancellation and journal replay
//! - agent registration and heartbeats
//! - agent-published step events and an SSE tap of the bus
//! - layered context reads/writes and tool invocations
//!
//! The server can be started standalone (`start_server`) or on top of a
//! pre-built `AppState` shared with another consumer such as the CLI.

pub mod api;

pub use weave_core::{error, models, state};

use std::net::SocketAddr;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use weave_core::{Database, EngineConfig};

use self::state::AppState;

/// Configuration for the Weave HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// Optional YAML file with engine tunables.
    pub config_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3210,
            db_path: "weave.db".to_string(),
            config_path: None,
        }
    }
}

/// Install the global `tracing` subscriber. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weave_server=info,weave_core=info,tower_http=info".into()),
        )
        .try_init();
}

/// Load the engine configuration: the YAML file when given, defaults otherwise.
pub fn load_engine_config(config_path: Option<&str>) -> Result<EngineConfig, String> {
    match config_path {
        Some(path) => EngineConfig::from_file(path)
            .map_err(|e| format!("Failed to load config {}: {}", path, e)),
        None => Ok(EngineConfig::default()),
    }
}

/// Create a shared, started `AppState` from a database path.
///
/// Interrupted workflows found in the database are resumed before this
/// returns.
pub async fn create_app_state(db_path: &str, config: EngineConfig) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    weave_core::create_app_state(db, config)
        .await
        .map_err(|e| format!("Failed to start services: {}", e))
}

/// Start the HTTP server.
///
/// Returns the actual address the server is listening on.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    init_tracing();

    tracing::info!(
        "Starting Weave server on {}:{}",
        config.host,
        config.port
    );

    let engine_config = load_engine_config(config.config_path.as_deref())?;
    let state = create_app_state(&config.db_path, engine_config).await?;

    start_server_with_state(config, state).await
}

/// The full application router, without a listener.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Weave server listening on http://{}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Weave server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "weave",
        "version": env!("CARGO_PKG_VERSION"),
        "activeWorkflows": state.engine.active_supervisors().await,
        "agents": state.registry.list().await.len(),
    }))
}
