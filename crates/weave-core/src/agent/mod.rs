//! In-process agent host.
//!
//! An `Agent` is the explicit capability interface: it names the step types
//! it can execute and runs one task at a time per call. `AgentWorker` binds
//! an agent to the bus the same way an out-of-process agent would:
//!
//!   1. subscribe to `step.dispatch` (handler `agent:<id>`)
//!   2. announce on `agent.register` and heartbeat on `agent.heartbeat`
//!   3. for every dispatch addressed to it: `step.started`, then exactly one
//!      of `step.completed` / `step.failed` per attempt id
//!   4. `agent.deregister` on stop

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ServerError;
use crate::events::EventBus;
use crate::models::agent::{AgentHealth, Capability};
use crate::models::context::{ContextWrite, ScopeLevel};
use crate::models::event::{
    AgentAnnouncePayload, AgentDeregisterPayload, AgentHeartbeatPayload, Event, EventType,
    StepCompletedPayload, StepDispatchPayload, StepFailedPayload, ToolBinding,
};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Attempt ids a worker remembers for redelivery checks.
const HANDLED_ATTEMPTS_CAP: usize = 1024;

/// Recently handled attempt ids, oldest evicted first.
struct HandledAttempts {
    ids: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl HandledAttempts {
    fn new(cap: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// `false` when the attempt was already handled.
    fn insert(&mut self, attempt_id: &str) -> bool {
        if self.ids.contains(attempt_id) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(attempt_id.to_string());
        self.order.push_back(attempt_id.to_string());
        true
    }
}

/// One dispatched step attempt as seen by an agent.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub workflow_id: String,
    pub step_id: String,
    pub attempt_id: String,
    pub attempt: u32,
    pub capability: Capability,
    pub config: serde_json::Value,
    pub tools: Vec<ToolBinding>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub result: serde_json::Value,
    pub context: Vec<ContextWrite>,
}

impl AgentOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            context: Vec::new(),
        }
    }

    /// Ask the engine to also write `key` at the given level of the step's
    /// context scope.
    pub fn with_context(mut self, scope: ScopeLevel, key: &str, value: serde_json::Value) -> Self {
        self.context.push(ContextWrite {
            scope,
            key: key.to_string(),
            value,
        });
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AgentFailure(pub String);

impl AgentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability>;

    async fn execute(&self, task: AgentTask) -> Result<AgentOutput, AgentFailure>;
}

/// Binds an `Agent` to the bus.
pub struct AgentWorker {
    agent: Arc<dyn Agent>,
    bus: EventBus,
    heartbeat_interval: Duration,
}

/// A running worker. Dropping it leaves the worker running; call `stop`.
pub struct AgentHandle {
    agent_id: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Deregister and wait for the worker loop to exit. Attempts already
    /// handed to the agent still report.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("[Agent] Worker {} panicked: {}", self.agent_id, e);
        }
    }
}

impl AgentWorker {
    pub fn new(agent: Arc<dyn Agent>, bus: EventBus) -> Self {
        Self {
            agent,
            bus,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub async fn spawn(self) -> Result<AgentHandle, ServerError> {
        let agent_id = self.agent.id().to_string();
        let handler_id = format!("agent:{}", agent_id);
        let mut dispatches = self
            .bus
            .subscribe(EventType::StepDispatch.topic(), &handler_id)
            .await;

        let announce = Event::new(
            EventType::AgentRegister,
            AgentAnnouncePayload {
                agent_id: agent_id.clone(),
                capabilities: self.agent.capabilities(),
            },
        );
        self.bus.emit(&announce).await?;
        tracing::info!("[Agent] {} announced", agent_id);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let worker_id = agent_id.clone();
        let task = tokio::spawn(async move {
            let mut handled = HandledAttempts::new(HANDLED_ATTEMPTS_CAP);
            let start = tokio::time::Instant::now() + self.heartbeat_interval;
            let mut heartbeat = tokio::time::interval_at(start, self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = heartbeat.tick() => {
                        let beat = Event::new(
                            EventType::AgentHeartbeat,
                            AgentHeartbeatPayload {
                                agent_id: worker_id.clone(),
                                health: Some(AgentHealth::Healthy),
                            },
                        );
                        if let Err(e) = self.bus.emit(&beat).await {
                            tracing::warn!("[Agent] {} heartbeat failed: {}", worker_id, e);
                        }
                    }
                    next = dispatches.recv() => match next {
                        Some(dispatch) => {
                            self.on_dispatch(dispatch, &worker_id, &mut handled).await;
                        }
                        None => break,
                    },
                }
            }

            self.bus.unsubscribe(&handler_id).await;
            let bye = Event::new(
                EventType::AgentDeregister,
                AgentDeregisterPayload {
                    agent_id: worker_id.clone(),
                },
            );
            if let Err(e) = self.bus.emit(&bye).await {
                tracing::warn!("[Agent] {} could not deregister: {}", worker_id, e);
            }
            tracing::info!("[Agent] {} stopped", worker_id);
        });

        Ok(AgentHandle {
            agent_id,
            shutdown,
            task,
        })
    }

    async fn on_dispatch(
        &self,
        dispatch: Event,
        agent_id: &str,
        handled: &mut HandledAttempts,
    ) {
        let payload: StepDispatchPayload = match dispatch.decode() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("[Agent] {} ignoring malformed dispatch: {}", agent_id, e);
                return;
            }
        };
        if payload.agent_id != agent_id {
            return;
        }
        let (Some(workflow_id), Some(step_id), Some(attempt_id)) = (
            dispatch.workflow_id.clone(),
            dispatch.step_id.clone(),
            dispatch.attempt_id.clone(),
        ) else {
            tracing::warn!("[Agent] {} got dispatch {} without ids", agent_id, dispatch.event_id);
            return;
        };
        // Redelivered dispatch: the attempt already has (or will have) its
        // terminal event.
        if !handled.insert(&attempt_id) {
            tracing::debug!("[Agent] {} already handling attempt {}", agent_id, attempt_id);
            return;
        }

        let task = AgentTask {
            workflow_id,
            step_id,
            attempt_id,
            attempt: payload.attempt,
            capability: payload.capability,
            config: payload.config,
            tools: payload.tools,
            timeout_ms: payload.timeout_ms,
        };
        let agent = self.agent.clone();
        let bus = self.bus.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            run_attempt(agent, bus, agent_id, task, dispatch).await;
        });
    }
}

async fn run_attempt(
    agent: Arc<dyn Agent>,
    bus: EventBus,
    agent_id: String,
    task: AgentTask,
    dispatch: Event,
) {
    let reply = |event_type: EventType, payload: serde_json::Value| {
        Event::new(event_type, payload)
            .for_workflow(&task.workflow_id)
            .for_step(&task.step_id)
            .with_attempt(&task.attempt_id)
            .caused_by(&dispatch)
    };

    let started = reply(
        EventType::StepStarted,
        serde_json::json!({ "agentId": agent_id }),
    );
    if let Err(e) = bus.emit(&started).await {
        tracing::warn!("[Agent] {} could not report start of {}: {}", agent_id, task.step_id, e);
    }

    tracing::debug!(
        "[Agent] {} executing {}/{} (attempt {})",
        agent_id,
        task.workflow_id,
        task.step_id,
        task.attempt
    );
    let terminal = match agent.execute(task.clone()).await {
        Ok(output) => reply(
            EventType::StepCompleted,
            serde_json::to_value(StepCompletedPayload {
                agent_id: Some(agent_id.clone()),
                result: output.result,
                context: output.context,
            })
            .unwrap_or_default(),
        ),
        Err(failure) => reply(
            EventType::StepFailed,
            serde_json::to_value(StepFailedPayload {
                agent_id: Some(agent_id.clone()),
                message: failure.0,
                code: None,
            })
            .unwrap_or_default(),
        ),
    };
    if let Err(e) = bus.emit(&terminal).await {
        tracing::error!(
            "[Agent] {} could not report {} for {}: {}",
            agent_id,
            terminal.event_type,
            task.step_id,
            e
        );
    }
}
