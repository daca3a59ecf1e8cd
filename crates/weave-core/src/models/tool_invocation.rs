use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InvocationStatus {
    Pending,
    Succeeded,
    Failed,
    CircuitOpen,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::CircuitOpen => "circuitOpen",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "circuitOpen" => Some(Self::CircuitOpen),
            _ => None,
        }
    }
}

/// Which step attempt a tool call was made on behalf of, when known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
}

/// Audit record of one adapter attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub id: String,
    pub requested_capability: String,
    pub chosen_adapter_id: String,
    /// 1-based position of this attempt within one `invoke` call.
    pub attempt: u32,
    pub status: InvocationStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub context: InvocationContext,
    pub created_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn new(
        capability: &str,
        adapter_id: &str,
        attempt: u32,
        context: &InvocationContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requested_capability: capability.to_string(),
            chosen_adapter_id: adapter_id.to_string(),
            attempt,
            status: InvocationStatus::Pending,
            latency_ms: 0,
            error: None,
            context: context.clone(),
            created_at: Utc::now(),
        }
    }
}
