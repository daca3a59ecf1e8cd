use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::definition::WorkflowDefinition;
use crate::models::step::ReasonCode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `running` and `waiting` together form the active super-state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Draft, Running) | (Draft, Cancelled) => true,
            (Running, Waiting) | (Waiting, Running) => true,
            (Running | Waiting, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Retry/backoff policy applied to failed step attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the computed delay randomized away, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetryPolicy(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ValidationError::InvalidRetryPolicy(
                "backoffCapMs must not be smaller than backoffBaseMs".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ValidationError::InvalidRetryPolicy(
                "jitter must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Structured reason attached to a failed or cancelled workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFailure {
    pub code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub status: WorkflowStatus,
    pub retry: RetryPolicy,
    pub definition: WorkflowDefinition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<WorkflowFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(id: String, definition: WorkflowDefinition, default_retry: &RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: definition.name.clone(),
            description: definition.description.clone(),
            project_id: definition.resolved_project_id(),
            tenant_id: definition.tenant_id.clone(),
            status: WorkflowStatus::Draft,
            retry: definition.retry.clone().unwrap_or_else(|| default_retry.clone()),
            definition,
            failure: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Whether the workflow reached a terminal state and was closed out.
    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal() && self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            for next in [
                WorkflowStatus::Draft,
                WorkflowStatus::Running,
                WorkflowStatus::Waiting,
                WorkflowStatus::Completed,
                WorkflowStatus::Failed,
                WorkflowStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn draft_only_starts_or_cancels() {
        assert!(WorkflowStatus::Draft.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Draft.can_transition_to(WorkflowStatus::Cancelled));
        assert!(!WorkflowStatus::Draft.can_transition_to(WorkflowStatus::Completed));
        assert!(WorkflowStatus::Waiting.can_transition_to(WorkflowStatus::Running));
    }

    #[test]
    fn retry_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
        let inverted = RetryPolicy {
            backoff_base_ms: 10,
            backoff_cap_ms: 5,
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }
}
