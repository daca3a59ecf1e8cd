//! Core error types for the Weave orchestration core.
//!
//! `ServerError` is used throughout the core domain (stores, engine, bus).
//! When the `axum` feature is enabled, it also implements `IntoResponse`
//! so it can be used directly as an axum handler error type.

/// Rejections raised while validating a workflow definition at submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("workflow must contain at least one step")]
    EmptyWorkflow,

    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("step id must not be empty")]
    EmptyStepId,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("step {0} depends on itself")]
    SelfDependency(String),

    #[error("cyclic dependency between steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("step {step} has unknown type {step_type}")]
    UnknownStepType { step: String, step_type: String },

    #[error("invalid fallback on step {step}: {reason}")]
    InvalidFallback { step: String, reason: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("malformed definition: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Stable reason code reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyWorkflow => "empty-workflow",
            Self::EmptyName => "empty-name",
            Self::EmptyStepId => "empty-step-id",
            Self::DuplicateStepId(_) => "duplicate-step-id",
            Self::UnknownDependency { .. } => "unknown-dependency",
            Self::SelfDependency(_) => "self-dependency",
            Self::CyclicDependency(_) => "cyclic-dependency",
            Self::UnknownStepType { .. } => "unknown-step-type",
            Self::InvalidFallback { .. } => "invalid-fallback",
            Self::InvalidRetryPolicy(_) => "invalid-retry-policy",
            Self::Malformed(_) => "malformed-definition",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Retriable: the dependency (bus, adapter) is currently unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ServerError::Unavailable(_) | ServerError::Database(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Database(_) => "database",
            ServerError::NotFound(_) => "not-found",
            ServerError::BadRequest(_) => "bad-request",
            ServerError::Conflict(_) => "conflict",
            ServerError::Validation(v) => v.code(),
            ServerError::Unavailable(_) => "unavailable",
            ServerError::Internal(_) => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            ServerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string(), "code": self.code() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_reason_codes() {
        let err: ServerError =
            ValidationError::CyclicDependency(vec!["a".into(), "b".into()]).into();
        assert_eq!(err.code(), "cyclic-dependency");
        assert!(err.to_string().contains("a, b"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn unavailable_is_retriable() {
        assert!(ServerError::Unavailable("bus closed".into()).is_retriable());
        assert!(!ServerError::Conflict("x".into()).is_retriable());
    }
}
