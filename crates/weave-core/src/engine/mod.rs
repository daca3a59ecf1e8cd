//! Workflow engine - validates definitions, owns workflow lifecycles and
//! drives step dispatch through one supervisor task per active workflow.
//!
//! ```text
//!   bus ──(step.started / step.completed / step.failed / workflow.cancel)──▶ router
//!                                                                             │ by workflowId
//!                               ┌──────────────────────┬──────────────────────┘
//!                               ▼                      ▼
//!                         supervisor(wf-1)       supervisor(wf-2)   ── step.dispatch ──▶ bus
//! ```
//!
//! Supervisors never share workflow state; the router only forwards.

pub mod backoff;
pub mod dag;
pub mod state;
mod supervisor;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::ContextManager;
use crate::error::{ServerError, ValidationError};
use crate::events::EventBus;
use crate::models::definition::WorkflowDefinition;
use crate::models::event::{Event, EventType, WorkflowCancelPayload};
use crate::models::step::Step;
use crate::models::workflow::{Workflow, WorkflowStatus};
use crate::registry::AgentRegistry;
use crate::store::WorkflowStore;
use crate::tools::ToolOrchestrator;

pub use dag::StepGraph;
pub use state::WorkflowRun;
pub use supervisor::ENGINE_WRITER_ID;

use supervisor::Supervisor;

pub const ENGINE_HANDLER_ID: &str = "workflow-engine";

/// Everything a supervisor needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct EngineShared {
    pub store: WorkflowStore,
    pub bus: EventBus,
    pub registry: AgentRegistry,
    pub context: ContextManager,
    pub tools: ToolOrchestrator,
    pub config: Arc<EngineConfig>,
    pub supervisors: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>,
}

/// A workflow together with its step rows, as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<Step>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    shared: EngineShared,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Serializes lifecycle transitions made outside a supervisor.
    lifecycle: Arc<Mutex<()>>,
}

impl WorkflowEngine {
    pub fn new(
        store: WorkflowStore,
        bus: EventBus,
        registry: AgentRegistry,
        context: ContextManager,
        tools: ToolOrchestrator,
        config: EngineConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: EngineShared {
                store,
                bus,
                registry,
                context,
                tools,
                config: Arc::new(config),
                supervisors: Arc::new(RwLock::new(HashMap::new())),
            },
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ─── Submission ─────────────────────────────────────────────────────

    /// Check a definition without storing anything.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<StepGraph, ValidationError> {
        StepGraph::build(definition)
    }

    /// Validate and store a definition as a new `draft` workflow.
    pub async fn submit(&self, definition: WorkflowDefinition) -> Result<Workflow, ServerError> {
        let graph = self.validate(&definition).map_err(|e| {
            tracing::warn!("[Engine] Rejected workflow {:?}: {}", definition.name, e);
            e
        })?;
        let workflow = Workflow::new(
            uuid::Uuid::new_v4().to_string(),
            definition,
            &self.shared.config.retry,
        );
        let steps: Vec<Step> = workflow
            .definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, def)| Step::from_definition(&workflow.id, i, def, graph.capability(i)))
            .collect();
        self.shared.store.create(&workflow, &steps).await?;
        tracing::info!(
            "[Engine] Submitted workflow {} ({}, {} steps)",
            workflow.id,
            workflow.name,
            steps.len()
        );
        Ok(workflow)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Start a `draft` workflow. Executing an active workflow is a no-op that
    /// returns its current state.
    pub async fn execute(&self, workflow_id: &str) -> Result<WorkflowDetail, ServerError> {
        let _guard = self.lifecycle.lock().await;
        let mut run = self.load_run(workflow_id).await?;
        match run.workflow.status {
            WorkflowStatus::Draft => {}
            status if status.is_active() => {
                if !self.is_supervised(workflow_id).await {
                    self.spawn_supervisor(run, true).await;
                }
                return self.get(workflow_id).await;
            }
            status => {
                return Err(ServerError::Conflict(format!(
                    "workflow {} is already {}",
                    workflow_id,
                    status.as_str()
                )))
            }
        }

        run.start(Utc::now());
        self.shared.store.save_run(&run.workflow, &run.steps).await?;
        let started = Event::new(
            EventType::WorkflowStarted,
            serde_json::json!({ "name": run.workflow.name, "steps": run.steps.len() }),
        )
        .for_workflow(workflow_id);
        self.publish(&started).await?;
        tracing::info!("[Engine] Workflow {} started", workflow_id);

        let detail = WorkflowDetail {
            workflow: run.workflow.clone(),
            steps: run.steps.clone(),
        };
        self.spawn_supervisor(run, false).await;
        Ok(detail)
    }

    /// Request cancellation. Drafts are cancelled on the spot; active
    /// workflows get a `workflow.cancel` event and finish asynchronously once
    /// in-flight steps report or the grace period expires.
    pub async fn cancel(
        &self,
        workflow_id: &str,
        reason: Option<String>,
    ) -> Result<WorkflowDetail, ServerError> {
        let _guard = self.lifecycle.lock().await;
        let mut run = self.load_run(workflow_id).await?;
        let status = run.workflow.status;
        if status.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "workflow {} is already {}",
                workflow_id,
                status.as_str()
            )));
        }

        if status == WorkflowStatus::Draft {
            let now = Utc::now();
            run.cancel(reason, now);
            run.finalize(now);
            self.shared.store.save_run(&run.workflow, &run.steps).await?;
            let event = Event::new(EventType::WorkflowCancelled, &run.workflow.failure)
                .for_workflow(workflow_id);
            self.publish(&event).await?;
            tracing::info!("[Engine] Draft workflow {} cancelled", workflow_id);
            return Ok(WorkflowDetail {
                workflow: run.workflow,
                steps: run.steps,
            });
        }

        if !self.is_supervised(workflow_id).await {
            self.spawn_supervisor(run, true).await;
        }
        let event = Event::new(EventType::WorkflowCancel, WorkflowCancelPayload { reason })
            .for_workflow(workflow_id);
        self.publish(&event).await?;
        tracing::info!("[Engine] Cancel requested for workflow {}", workflow_id);
        self.get(workflow_id).await
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowDetail, ServerError> {
        let workflow = self
            .shared
            .store
            .get(workflow_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Workflow {} not found", workflow_id)))?;
        let steps = self.shared.store.list_steps(workflow_id).await?;
        Ok(WorkflowDetail { workflow, steps })
    }

    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, ServerError> {
        self.shared.store.list(status).await
    }

    /// Journaled bus events of a workflow, oldest first.
    pub async fn events(&self, workflow_id: &str) -> Result<Vec<Event>, ServerError> {
        if self.shared.store.get(workflow_id).await?.is_none() {
            return Err(ServerError::NotFound(format!("Workflow {} not found", workflow_id)));
        }
        self.shared.bus.replay(workflow_id).await
    }

    pub async fn is_supervised(&self, workflow_id: &str) -> bool {
        self.shared.supervisors.read().await.contains_key(workflow_id)
    }

    pub async fn active_supervisors(&self) -> usize {
        self.shared.supervisors.read().await.len()
    }

    // ─── Background ─────────────────────────────────────────────────────

    /// Subscribe the router and resume whatever the previous process left
    /// behind. Call once, before any workflow is executed.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut sub = self
            .shared
            .bus
            .subscribe_many(
                &[
                    EventType::StepStarted.topic(),
                    EventType::StepCompleted.topic(),
                    EventType::StepFailed.topic(),
                    EventType::WorkflowCancel.topic(),
                ],
                ENGINE_HANDLER_ID,
            )
            .await;
        let supervisors = self.shared.supervisors.clone();
        let mut shutdown = self.shutdown.subscribe();
        let router = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = sub.recv() => match next {
                        Some(event) => route(&supervisors, event).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("[Engine] Router stopped");
        });
        self.tasks.lock().await.push(router);

        let resumed = self.recover().await?;
        tracing::info!("[Engine] Started ({} workflows resumed)", resumed);
        Ok(())
    }

    /// Finalize interrupted cancellations and resume active workflows.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let _guard = self.lifecycle.lock().await;
        for workflow in self.shared.store.list_unfinalized_cancelled().await? {
            let mut run = self.load_run(&workflow.id).await?;
            let now = Utc::now();
            let expired = run.expire_cancel(now);
            run.finalize(now);
            self.shared.store.save_run(&run.workflow, &run.steps).await?;
            tracing::info!(
                "[Engine] Finalized cancelled workflow {} ({} steps expired)",
                workflow.id,
                expired.len()
            );
            let event = Event::new(EventType::WorkflowCancelled, &run.workflow.failure)
                .for_workflow(&workflow.id);
            if let Err(e) = self.publish(&event).await {
                tracing::warn!("[Engine] Could not announce cancellation of {}: {}", workflow.id, e);
            }
        }

        let mut resumed = 0;
        for workflow in self.shared.store.list_active().await? {
            if self.is_supervised(&workflow.id).await {
                continue;
            }
            match self.load_run(&workflow.id).await {
                Ok(run) => {
                    self.spawn_supervisor(run, true).await;
                    resumed += 1;
                }
                Err(e) => tracing::error!("[Engine] Cannot resume workflow {}: {}", workflow.id, e),
            }
        }
        Ok(resumed)
    }

    /// Stop the router and every supervisor. Workflows stay as persisted and
    /// are resumed by the next `start`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("[Engine] Background task failed: {}", e);
            }
        }
        self.shared.supervisors.write().await.clear();
        tracing::info!("[Engine] Shut down");
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn load_run(&self, workflow_id: &str) -> Result<WorkflowRun, ServerError> {
        let detail = self.get(workflow_id).await?;
        Ok(WorkflowRun::new(detail.workflow, detail.steps)?)
    }

    async fn spawn_supervisor(&self, run: WorkflowRun, resumed: bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .supervisors
            .write()
            .await
            .insert(run.workflow.id.clone(), tx);
        let supervisor = Supervisor::new(run, self.shared.clone(), rx, self.shutdown.subscribe());
        let handle = tokio::spawn(supervisor.run(resumed));
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn publish(&self, event: &Event) -> Result<(), ServerError> {
        let config = &self.shared.config;
        self.shared
            .bus
            .publish_with_retry(event.topic(), event, config.publish_max_attempts, &config.retry)
            .await
    }
}

async fn route(
    supervisors: &RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>,
    event: Event,
) {
    let Some(workflow_id) = event.workflow_id.clone() else {
        tracing::debug!("[Engine] Dropping {} {} without workflowId", event.event_type, event.event_id);
        return;
    };
    let tx = supervisors.read().await.get(&workflow_id).cloned();
    let late = match tx {
        Some(tx) => tx.send(event).err().map(|e| e.0),
        None => Some(event),
    };
    if let Some(event) = late {
        tracing::warn!(
            "[Engine] Late {} event {} for workflow {} without a running supervisor",
            event.event_type,
            event.event_id,
            workflow_id
        );
    }
}
