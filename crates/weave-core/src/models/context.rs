use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Project,
    Feature,
    Step,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Feature => "feature",
            Self::Step => "step",
        }
    }
}

/// Address of one context layer: `project/<p>`, `feature/<p>/<f>` or
/// `step/<p>/<f>/<s>`. A step scope always sits inside a feature scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextScope {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ContextScope {
    pub fn project(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            feature_id: None,
            step_id: None,
        }
    }

    pub fn feature(project_id: &str, feature_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            feature_id: Some(feature_id.to_string()),
            step_id: None,
        }
    }

    pub fn step(project_id: &str, feature_id: &str, step_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            feature_id: Some(feature_id.to_string()),
            step_id: Some(step_id.to_string()),
        }
    }

    pub fn level(&self) -> ScopeLevel {
        match (&self.feature_id, &self.step_id) {
            (Some(_), Some(_)) => ScopeLevel::Step,
            (Some(_), None) => ScopeLevel::Feature,
            _ => ScopeLevel::Project,
        }
    }

    /// The nearest enclosing scope, `None` at project level.
    pub fn parent(&self) -> Option<Self> {
        match self.level() {
            ScopeLevel::Step => Some(Self {
                project_id: self.project_id.clone(),
                feature_id: self.feature_id.clone(),
                step_id: None,
            }),
            ScopeLevel::Feature => Some(Self::project(&self.project_id)),
            ScopeLevel::Project => None,
        }
    }

    /// This scope followed by every enclosing scope, most specific first.
    pub fn chain(&self) -> Vec<Self> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(scope) = current {
            current = scope.parent();
            chain.push(scope);
        }
        chain
    }

    /// Re-target this scope to another level of the same lineage.
    pub fn at_level(&self, level: ScopeLevel) -> Option<Self> {
        match level {
            ScopeLevel::Project => Some(Self::project(&self.project_id)),
            ScopeLevel::Feature => self
                .feature_id
                .as_deref()
                .map(|f| Self::feature(&self.project_id, f)),
            ScopeLevel::Step => match (&self.feature_id, &self.step_id) {
                (Some(f), Some(s)) => Some(Self::step(&self.project_id, f, s)),
                _ => None,
            },
        }
    }

    /// Storage key, e.g. `step/payments/wf-1/build`.
    pub fn key(&self) -> String {
        match (&self.feature_id, &self.step_id) {
            (Some(f), Some(s)) => format!("step/{}/{}/{}", self.project_id, f, s),
            (Some(f), None) => format!("feature/{}/{}", self.project_id, f),
            _ => format!("project/{}", self.project_id),
        }
    }

    /// Parse a storage key back into a scope.
    pub fn parse(raw: &str) -> Result<Self, ServerError> {
        let parts: Vec<&str> = raw.split('/').collect();
        let invalid = || ServerError::BadRequest(format!("Invalid context scope: {}", raw));
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            ["project", p] => Ok(Self::project(p)),
            ["feature", p, f] => Ok(Self::feature(p, f)),
            ["step", p, f, s] => Ok(Self::step(p, f, s)),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One immutable version of a key within a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextLayer {
    pub scope: String,
    pub key: String,
    pub value: serde_json::Value,
    /// Monotonic per (scope, key), starting at 1.
    pub version: u64,
    /// Global commit sequence; the snapshot handle for reads.
    pub seq: u64,
    pub writer_id: String,
    pub written_at: DateTime<Utc>,
}

/// A context write requested by an agent alongside a step completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextWrite {
    #[serde(default = "default_write_level")]
    pub scope: ScopeLevel,
    pub key: String,
    pub value: serde_json::Value,
}

fn default_write_level() -> ScopeLevel {
    ScopeLevel::Feature
}
