//! Engine configuration.
//!
//! Every field has a default, so an empty YAML document is a valid config:
//!
//! ```yaml
//! retry:
//!   maxAttempts: 5
//! stepTimeoutMs: 600000
//! circuitBreaker:
//!   failureThreshold: 3
//! tools:
//!   - id: sonar
//!     capability: code-analysis
//!     endpoint: http://localhost:9000/analyze
//!     healthEndpoint: http://localhost:9000/health
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::dag::MAX_STEP_TIMEOUT_MS;
use crate::error::ServerError;
use crate::models::workflow::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Default retry policy; workflows may override it.
    pub retry: RetryPolicy,
    pub step_timeout_ms: u64,
    /// How long in-flight steps may keep running after a cancel.
    pub cancellation_grace_ms: u64,
    pub agent_heartbeat_timeout_ms: u64,
    pub agent_sweep_interval_ms: u64,
    /// Delay between attempts to find an agent for a ready step.
    pub agent_wait_interval_ms: u64,
    pub agent_wait_max_attempts: u32,
    pub publish_max_attempts: u32,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scoring: ScoringPolicy,
    pub tool_timeout_ms: u64,
    pub tools: Vec<ToolEndpointConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout_ms: 300_000,
            cancellation_grace_ms: 30_000,
            agent_heartbeat_timeout_ms: 30_000,
            agent_sweep_interval_ms: 5_000,
            agent_wait_interval_ms: 2_000,
            agent_wait_max_attempts: 30,
            publish_max_attempts: 5,
            circuit_breaker: CircuitBreakerConfig::default(),
            scoring: ScoringPolicy::default(),
            tool_timeout_ms: 30_000,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `window_ms` that open the circuit.
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Weights of the adapter ranking score:
/// `success_weight * success_rate + latency_weight / (1 + latency / latency_reference_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringPolicy {
    pub success_weight: f64,
    pub latency_weight: f64,
    /// EWMA smoothing factor in `(0, 1]`; higher forgets faster.
    pub decay: f64,
    pub latency_reference_ms: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            latency_weight: 0.3,
            decay: 0.2,
            latency_reference_ms: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolEndpointConfig {
    pub id: String,
    pub capability: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ServerError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ServerError::BadRequest(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::BadRequest(format!("failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.retry.validate()?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ServerError::BadRequest(
                "circuitBreaker.failureThreshold must be at least 1".to_string(),
            ));
        }
        if !(self.scoring.decay > 0.0 && self.scoring.decay <= 1.0) {
            return Err(ServerError::BadRequest(
                "scoring.decay must be within (0, 1]".to_string(),
            ));
        }
        if self.scoring.latency_reference_ms <= 0.0 {
            return Err(ServerError::BadRequest(
                "scoring.latencyReferenceMs must be positive".to_string(),
            ));
        }
        if self.step_timeout_ms == 0 || self.step_timeout_ms > MAX_STEP_TIMEOUT_MS {
            return Err(ServerError::BadRequest(format!(
                "stepTimeoutMs must be within 1..={}",
                MAX_STEP_TIMEOUT_MS
            )));
        }
        if self.publish_max_attempts == 0 {
            return Err(ServerError::BadRequest(
                "publishMaxAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
