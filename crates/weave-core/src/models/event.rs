//! Bus event envelope and the typed payloads carried on each topic.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::models::agent::{AgentHealth, Capability};
use crate::models::context::ContextWrite;
use crate::models::step::ReasonCode;

pub const EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancel")]
    WorkflowCancel,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "step.dispatch")]
    StepDispatch,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.retry-scheduled")]
    StepRetryScheduled,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "agent.register")]
    AgentRegister,
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat,
    #[serde(rename = "agent.deregister")]
    AgentDeregister,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancel => "workflow.cancel",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::StepDispatch => "step.dispatch",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepRetryScheduled => "step.retry-scheduled",
            Self::StepSkipped => "step.skipped",
            Self::AgentRegister => "agent.register",
            Self::AgentHeartbeat => "agent.heartbeat",
            Self::AgentDeregister => "agent.deregister",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow.started" => Some(Self::WorkflowStarted),
            "workflow.completed" => Some(Self::WorkflowCompleted),
            "workflow.failed" => Some(Self::WorkflowFailed),
            "workflow.cancel" => Some(Self::WorkflowCancel),
            "workflow.cancelled" => Some(Self::WorkflowCancelled),
            "step.dispatch" => Some(Self::StepDispatch),
            "step.started" => Some(Self::StepStarted),
            "step.completed" => Some(Self::StepCompleted),
            "step.failed" => Some(Self::StepFailed),
            "step.retry-scheduled" => Some(Self::StepRetryScheduled),
            "step.skipped" => Some(Self::StepSkipped),
            "agent.register" => Some(Self::AgentRegister),
            "agent.heartbeat" => Some(Self::AgentHeartbeat),
            "agent.deregister" => Some(Self::AgentDeregister),
            _ => None,
        }
    }

    /// Default topic an event of this type is published on.
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }

    /// Terminal step events an agent may publish once per attempt.
    pub fn is_step_terminal(&self) -> bool {
        matches!(self, Self::StepCompleted | Self::StepFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable bus event. `event_id` doubles as the consumer idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "Utc::now")]
    pub produced_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    EVENT_SCHEMA_VERSION
}

impl Event {
    pub fn new(event_type: EventType, payload: impl Serialize) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            workflow_id: None,
            step_id: None,
            attempt_id: None,
            causation_id: None,
            correlation_id: None,
            payload: serde_json::to_value(payload).unwrap_or_default(),
            schema_version: EVENT_SCHEMA_VERSION,
            produced_at: Utc::now(),
        }
    }

    /// Scope the event to a workflow; the workflow id is also the correlation id.
    pub fn for_workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self.correlation_id = Some(workflow_id.to_string());
        self
    }

    pub fn for_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt_id: &str) -> Self {
        self.attempt_id = Some(attempt_id.to_string());
        self
    }

    pub fn caused_by(mut self, cause: &Event) -> Self {
        self.causation_id = Some(cause.event_id.clone());
        if self.correlation_id.is_none() {
            self.correlation_id = cause.correlation_id.clone();
        }
        self
    }

    pub fn topic(&self) -> &'static str {
        self.event_type.topic()
    }

    /// Decode the payload into one of the typed payload structs below.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ServerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ServerError::BadRequest(format!(
                "invalid {} payload in event {}: {}",
                self.event_type, self.event_id, e
            ))
        })
    }
}

// ─── Payloads ──────────────────────────────────────────────────────────────

/// Tool adapters the orchestrator currently ranks for one capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolBinding {
    pub capability: String,
    pub adapters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDispatchPayload {
    pub agent_id: String,
    pub capability: Capability,
    pub attempt: u32,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<ToolBinding>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub result: serde_json::Value,
    /// Additional context writes requested by the agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextWrite>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepFailedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Set on failures the engine itself reports (timeouts, restarts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ReasonCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentAnnouncePayload {
    pub agent_id: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeatPayload {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<AgentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeregisterPayload {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCancelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
