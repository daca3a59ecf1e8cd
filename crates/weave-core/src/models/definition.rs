//! Submission-time workflow definitions.
//!
//! A definition is what clients POST (JSON) or keep on disk (YAML):
//!
//! ```yaml
//! name: "Feature delivery"
//! projectId: "payments"
//! retry:
//!   maxAttempts: 3
//! steps:
//!   - id: design
//!     type: design
//!   - id: build
//!     type: build
//!     dependsOn: [design]
//!     tools: [code-analysis]
//!     config:
//!       spec: "${steps.design.result}"
//!   - id: test
//!     type: test
//!     dependsOn: [build]
//!   - id: manual-test
//!     type: test
//!     fallbackFor: test
//! ```
//!
//! Step types stay strings here so that an unknown type surfaces as a
//! validation error instead of a parse error.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::workflow::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Root of the context layering. Defaults to the tenant, then "default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Opaque owning tenant reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Overrides the engine's default retry policy for every step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,

    /// Agent capability, e.g. "build".
    #[serde(rename = "type")]
    pub step_type: String,

    /// Opaque agent input. String leaves may contain `${context.<key>}` and
    /// `${steps.<id>.result}` placeholders resolved at dispatch.
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default)]
    pub continue_on_failure: bool,

    /// This step is the designated fallback path of the named step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_for: Option<String>,

    /// Tool capabilities resolved through the tool orchestrator at dispatch.
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_required() -> bool {
    true
}

impl StepDefinition {
    /// Minimal step with defaults, mostly for tests and embedders.
    pub fn new(id: &str, step_type: &str, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            step_type: step_type.to_string(),
            config: serde_json::Value::Null,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            required: true,
            continue_on_failure: false,
            fallback_for: None,
            tools: Vec::new(),
            max_attempts: None,
            timeout_ms: None,
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: &str, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            project_id: None,
            tenant_id: None,
            retry: None,
            steps,
        }
    }

    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ValidationError::Malformed(format!("invalid workflow YAML: {}", e)))
    }

    /// Parse a workflow definition from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::Malformed(format!("invalid workflow JSON: {}", e)))
    }

    /// Load a workflow definition from a file path (`.json` or YAML).
    pub fn from_file(path: &str) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::Malformed(format!("failed to read workflow file '{}': {}", path, e))
        })?;
        if path.ends_with(".json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// The project the workflow's context layers hang off.
    pub fn resolved_project_id(&self) -> String {
        self.project_id
            .clone()
            .or_else(|| self.tenant_id.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}
