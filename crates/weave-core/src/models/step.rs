use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::agent::Capability;
use crate::models::definition::StepDefinition;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Ready,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "dispatched" => Some(Self::Dispatched),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Structured reason codes for failed/skipped steps and workflows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    Timeout,
    AgentError,
    NoAgentAvailable,
    UpstreamFailure,
    Cancelled,
    CancelledTimeout,
    WorkflowFailed,
    FallbackNotNeeded,
    Abandoned,
    EngineRestart,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::AgentError => "agent-error",
            Self::NoAgentAvailable => "no-agent-available",
            Self::UpstreamFailure => "upstream-failure",
            Self::Cancelled => "cancelled",
            Self::CancelledTimeout => "cancelled-timeout",
            Self::WorkflowFailed => "workflow-failed",
            Self::FallbackNotNeeded => "fallback-not-needed",
            Self::Abandoned => "abandoned",
            Self::EngineRestart => "engine-restart",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(Self::Timeout),
            "agent-error" => Some(Self::AgentError),
            "no-agent-available" => Some(Self::NoAgentAvailable),
            "upstream-failure" => Some(Self::UpstreamFailure),
            "cancelled" => Some(Self::Cancelled),
            "cancelled-timeout" => Some(Self::CancelledTimeout),
            "workflow-failed" => Some(Self::WorkflowFailed),
            "fallback-not-needed" => Some(Self::FallbackNotNeeded),
            "abandoned" => Some(Self::Abandoned),
            "engine-restart" => Some(Self::EngineRestart),
            _ => None,
        }
    }

    /// Codes an agent may attach to its own `step.failed`. The rest describe
    /// engine decisions.
    pub fn reportable_by_agent(&self) -> bool {
        matches!(self, Self::Timeout | Self::AgentError | Self::NoAgentAvailable)
    }

    /// Skips for these reasons count as a failed dependency downstream.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::UpstreamFailure | Self::Cancelled | Self::WorkflowFailed
        )
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub code: ReasonCode,
    pub message: String,
}

impl StepError {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub workflow_id: String,
    /// Position in the workflow's step arena.
    pub index: usize,
    #[serde(rename = "type")]
    pub step_type: Capability,
    pub config: serde_json::Value,
    pub depends_on: Vec<String>,
    pub required: bool,
    pub continue_on_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_for: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_attempt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<ReasonCode>,
    /// Set while a failed attempt waits out its backoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_waits: u32,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn from_definition(
        workflow_id: &str,
        index: usize,
        definition: &StepDefinition,
        step_type: Capability,
    ) -> Self {
        Self {
            id: definition.id.clone(),
            workflow_id: workflow_id.to_string(),
            index,
            step_type,
            config: definition.config.clone(),
            depends_on: definition.depends_on.clone(),
            required: definition.required,
            continue_on_failure: definition.continue_on_failure,
            fallback_for: definition.fallback_for.clone(),
            tools: definition.tools.clone(),
            max_attempts: definition.max_attempts,
            timeout_ms: definition.timeout_ms,
            status: StepStatus::Pending,
            attempt: 0,
            current_attempt_id: None,
            assigned_agent_id: None,
            result: None,
            error: None,
            skip_reason: None,
            next_retry_at: None,
            dispatch_waits: 0,
            updated_at: Utc::now(),
        }
    }

    /// Terminal: no further transition will happen for this step.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            StepStatus::Succeeded | StepStatus::Skipped => true,
            StepStatus::Failed => self.next_retry_at.is_none(),
            _ => false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, StepStatus::Dispatched | StepStatus::Running)
    }

    pub fn awaiting_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.next_retry_at.is_some()
    }
}
