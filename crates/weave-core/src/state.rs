//! Shared application state: every service constructed once, explicitly,
//! and handed to the API handlers and the CLI.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::ContextManager;
use crate::db::Database;
use crate::engine::WorkflowEngine;
use crate::error::ServerError;
use crate::events::EventBus;
use crate::registry::AgentRegistry;
use crate::store::{AgentStore, ContextStore, EventStore, ToolInvocationStore, WorkflowStore};
use crate::tools::ToolOrchestrator;

pub struct AppStateInner {
    pub db: Database,
    pub config: EngineConfig,
    pub workflow_store: WorkflowStore,
    pub event_store: EventStore,
    pub bus: EventBus,
    pub registry: AgentRegistry,
    pub context: ContextManager,
    pub tools: ToolOrchestrator,
    pub engine: WorkflowEngine,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        let workflow_store = WorkflowStore::new(db.clone());
        let event_store = EventStore::new(db.clone());
        let bus = EventBus::new(event_store.clone());
        let registry = AgentRegistry::new(
            AgentStore::new(db.clone()),
            Duration::from_millis(config.agent_heartbeat_timeout_ms),
        );
        let context = ContextManager::new(ContextStore::new(db.clone()));
        let tools = ToolOrchestrator::new(ToolInvocationStore::new(db.clone()), &config);
        let engine = WorkflowEngine::new(
            workflow_store.clone(),
            bus.clone(),
            registry.clone(),
            context.clone(),
            tools.clone(),
            config.clone(),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            config,
            workflow_store,
            event_store,
            bus,
            registry,
            context,
            tools,
            engine,
            shutdown,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Restore registrations, start the registry listener and sweeper,
    /// register configured tools, then start the engine (which resumes
    /// interrupted workflows).
    pub async fn start(&self) -> Result<(), ServerError> {
        self.registry.load().await?;
        let listener = self
            .registry
            .spawn_listener(&self.bus, self.shutdown.subscribe())
            .await;
        let sweeper = self.registry.spawn_sweeper(
            Duration::from_millis(self.config.agent_sweep_interval_ms),
            self.shutdown.subscribe(),
        );
        self.background.lock().await.extend([listener, sweeper]);

        self.tools.register_configured(&self.config).await?;
        self.engine.start().await?;
        tracing::info!("[State] Services started");
        Ok(())
    }

    /// Stop supervisors and background tasks, then close the bus.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.bus.close().await;
    }
}

pub async fn create_app_state(db: Database, config: EngineConfig) -> Result<AppState, ServerError> {
    config.validate()?;
    let state = Arc::new(AppStateInner::new(db, config));
    state.start().await?;
    Ok(state)
}
