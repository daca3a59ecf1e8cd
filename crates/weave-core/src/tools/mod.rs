//! Tool orchestrator - resolves a tool capability to one of several
//! registered adapters.
//!
//! Adapters of a capability are ranked by score (see `scoring`). An
//! invocation walks the ranking: adapters with an open circuit are skipped,
//! failures fall through to the next adapter, and only an exhausted list
//! fails the call. Every attempt, skipped ones included, is recorded as a
//! `ToolInvocation`.

pub mod circuit_breaker;
pub mod http_adapter;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{CircuitBreakerConfig, EngineConfig, ScoringPolicy};
use crate::error::ServerError;
use crate::models::event::ToolBinding;
use crate::models::tool_invocation::{InvocationContext, InvocationStatus, ToolInvocation};
use crate::store::ToolInvocationStore;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use http_adapter::HttpToolAdapter;
pub use scoring::AdapterStats;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("no adapter registered for capability {0}")]
    NoAdapters(String),

    #[error("all {attempts} adapters for {capability} failed; last error: {last_error}")]
    Exhausted {
        capability: String,
        attempts: u32,
        last_error: String,
    },
}

impl From<ToolError> for ServerError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NoAdapters(_) => ServerError::NotFound(err.to_string()),
            other => ServerError::Unavailable(other.to_string()),
        }
    }
}

/// Contract every external tool integration implements.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    async fn health_check(&self) -> bool {
        true
    }
}

struct RegisteredAdapter {
    capability: String,
    adapter: Arc<dyn ToolAdapter>,
    breaker: CircuitBreaker,
    stats: AdapterStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    pub adapter_id: String,
    pub capability: String,
    pub state: CircuitState,
    pub score: f64,
    pub success_rate: f64,
    pub latency_ms: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub adapter_id: String,
    pub capability: String,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct ToolOrchestrator {
    adapters: Arc<RwLock<HashMap<String, Vec<Arc<RegisteredAdapter>>>>>,
    store: ToolInvocationStore,
    scoring: ScoringPolicy,
    breaker: CircuitBreakerConfig,
    call_timeout: Duration,
}

impl ToolOrchestrator {
    pub fn new(store: ToolInvocationStore, config: &EngineConfig) -> Self {
        Self {
            adapters: Arc::new(RwLock::new(HashMap::new())),
            store,
            scoring: config.scoring.clone(),
            breaker: config.circuit_breaker.clone(),
            call_timeout: Duration::from_millis(config.tool_timeout_ms),
        }
    }

    /// Register the HTTP tools listed in the engine config.
    pub async fn register_configured(&self, config: &EngineConfig) -> Result<(), ServerError> {
        for tool in &config.tools {
            self.register(&tool.capability, Arc::new(HttpToolAdapter::from_config(tool)))
                .await?;
        }
        Ok(())
    }

    pub async fn register(
        &self,
        capability: &str,
        adapter: Arc<dyn ToolAdapter>,
    ) -> Result<(), ServerError> {
        let mut adapters = self.adapters.write().await;
        let list = adapters.entry(capability.to_string()).or_default();
        if list.iter().any(|r| r.adapter.id() == adapter.id()) {
            return Err(ServerError::Conflict(format!(
                "adapter {} already registered for {}",
                adapter.id(),
                capability
            )));
        }
        tracing::info!("[Tools] Registered adapter {} for {}", adapter.id(), capability);
        list.push(Arc::new(RegisteredAdapter {
            capability: capability.to_string(),
            adapter,
            breaker: CircuitBreaker::new(&self.breaker),
            stats: AdapterStats::default(),
        }));
        Ok(())
    }

    pub async fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        caps.sort();
        caps
    }

    /// Adapters of a capability, best score first. Ties keep registration
    /// order.
    async fn ranked(&self, capability: &str) -> Vec<Arc<RegisteredAdapter>> {
        let mut list = self
            .adapters
            .read()
            .await
            .get(capability)
            .cloned()
            .unwrap_or_default();
        list.sort_by(|a, b| {
            b.stats
                .score(&self.scoring)
                .total_cmp(&a.stats.score(&self.scoring))
        });
        list
    }

    /// Ranked ids of the adapters whose circuit currently admits calls.
    pub async fn resolve(&self, capability: &str) -> Vec<String> {
        let now = Instant::now();
        self.ranked(capability)
            .await
            .into_iter()
            .filter(|r| r.breaker.admits_at(now))
            .map(|r| r.adapter.id().to_string())
            .collect()
    }

    /// Resolve every tool capability a step declared.
    pub async fn bindings(&self, capabilities: &[String]) -> Vec<ToolBinding> {
        let mut out = Vec::with_capacity(capabilities.len());
        for cap in capabilities {
            out.push(ToolBinding {
                capability: cap.clone(),
                adapters: self.resolve(cap).await,
            });
        }
        out
    }

    pub async fn invoke(
        &self,
        capability: &str,
        args: serde_json::Value,
        context: &InvocationContext,
    ) -> Result<serde_json::Value, ToolError> {
        let ranked = self.ranked(capability).await;
        if ranked.is_empty() {
            return Err(ToolError::NoAdapters(capability.to_string()));
        }

        let mut last_error = String::new();
        let mut attempt = 0u32;
        for entry in &ranked {
            attempt += 1;
            let adapter_id = entry.adapter.id().to_string();
            let mut record = ToolInvocation::new(capability, &adapter_id, attempt, context);

            let Some(permit) = entry.breaker.acquire() else {
                tracing::debug!("[Tools] Skipping {}: circuit open", adapter_id);
                record.status = InvocationStatus::CircuitOpen;
                last_error = format!("circuit open for {}", adapter_id);
                self.record(&record).await;
                continue;
            };

            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.call_timeout, entry.adapter.invoke(args.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(self.call_timeout.as_millis() as u64)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            record.latency_ms = latency_ms;

            match outcome {
                Ok(value) => {
                    permit.succeed();
                    entry.stats.record(&self.scoring, true, latency_ms);
                    record.status = InvocationStatus::Succeeded;
                    self.record(&record).await;
                    return Ok(value);
                }
                Err(e) => {
                    permit.fail();
                    entry.stats.record(&self.scoring, false, latency_ms);
                    tracing::warn!(
                        "[Tools] {} failed for {} (attempt {}): {}",
                        adapter_id,
                        capability,
                        attempt,
                        e
                    );
                    record.status = InvocationStatus::Failed;
                    record.error = Some(e.to_string());
                    last_error = e.to_string();
                    self.record(&record).await;
                }
            }
        }

        Err(ToolError::Exhausted {
            capability: capability.to_string(),
            attempts: attempt,
            last_error,
        })
    }

    async fn record(&self, invocation: &ToolInvocation) {
        if let Err(e) = self.store.save(invocation).await {
            tracing::error!("[Tools] Failed to record invocation {}: {}", invocation.id, e);
        }
    }

    pub async fn history(
        &self,
        capability: &str,
        limit: usize,
    ) -> Result<Vec<ToolInvocation>, ServerError> {
        self.store.list_by_capability(capability, limit).await
    }

    pub async fn status(&self) -> Vec<AdapterStatus> {
        let now = Instant::now();
        let mut out = Vec::new();
        for cap in self.capabilities().await {
            for entry in self.ranked(&cap).await {
                let stats = entry.stats.snapshot();
                out.push(AdapterStatus {
                    adapter_id: entry.adapter.id().to_string(),
                    capability: entry.capability.clone(),
                    state: entry.breaker.state_at(now),
                    score: scoring::score(&self.scoring, &stats),
                    success_rate: stats.success_rate,
                    latency_ms: stats.latency_ms,
                    samples: stats.samples,
                });
            }
        }
        out
    }

    pub async fn health_check_all(&self) -> Vec<AdapterHealth> {
        let all: Vec<Arc<RegisteredAdapter>> = self
            .adapters
            .read()
            .await
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        let mut out = Vec::with_capacity(all.len());
        for entry in all {
            let healthy = match tokio::time::timeout(self.call_timeout, entry.adapter.health_check()).await {
                Ok(h) => h,
                Err(_) => false,
            };
            out.push(AdapterHealth {
                adapter_id: entry.adapter.id().to_string(),
                capability: entry.capability.clone(),
                healthy,
            });
        }
        out.sort_by(|a, b| {
            a.capability
                .cmp(&b.capability)
                .then_with(|| a.adapter_id.cmp(&b.adapter_id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        id: String,
        fail: bool,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ToolAdapter for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(ToolError::Failed(format!("{} is down", self.id)))
            } else {
                Ok(json!({ "by": self.id, "args": args }))
            }
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    fn orchestrator(config: EngineConfig) -> (ToolOrchestrator, ToolInvocationStore) {
        let store = ToolInvocationStore::new(Database::open_in_memory().unwrap());
        (ToolOrchestrator::new(store.clone(), &config), store)
    }

    #[tokio::test]
    async fn falls_through_to_next_adapter_and_records_every_attempt() {
        let (tools, store) = orchestrator(EngineConfig::default());
        tools.register("lint", Scripted::new("primary", true)).await.unwrap();
        tools.register("lint", Scripted::new("backup", false)).await.unwrap();

        let ctx = InvocationContext {
            workflow_id: Some("wf".into()),
            step_id: Some("build".into()),
            attempt_id: None,
        };
        let out = tools.invoke("lint", json!({"path": "src"}), &ctx).await.unwrap();
        assert_eq!(out["by"], "backup");

        let records = store.list_by_step("wf", "build").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chosen_adapter_id, "primary");
        assert_eq!(records[0].status, InvocationStatus::Failed);
        assert_eq!(records[1].status, InvocationStatus::Succeeded);

        // The failing adapter now ranks below the healthy one.
        assert_eq!(tools.resolve("lint").await, vec!["backup", "primary"]);
    }

    #[tokio::test]
    async fn exhausted_list_fails_and_unknown_capability_is_reported() {
        let (tools, _) = orchestrator(EngineConfig::default());
        tools.register("scan", Scripted::new("only", true)).await.unwrap();
        let err = tools
            .invoke("scan", json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Exhausted { attempts: 1, .. }));

        let err = tools
            .invoke("nope", json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::NoAdapters("nope".into()));
    }

    #[tokio::test]
    async fn open_circuit_is_skipped_without_calling_the_adapter() {
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        let (tools, store) = orchestrator(config);
        let flaky = Scripted::new("flaky", true);
        tools.register("deploy", flaky.clone()).await.unwrap();

        for _ in 0..2 {
            let _ = tools.invoke("deploy", json!({}), &InvocationContext::default()).await;
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert!(tools.resolve("deploy").await.is_empty());

        let _ = tools.invoke("deploy", json!({}), &InvocationContext::default()).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        let records = store.list_by_capability("deploy", 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records
                .iter()
                .filter(|r| r.status == InvocationStatus::CircuitOpen)
                .count(),
            1
        );

        let status = tools.status().await;
        assert_eq!(status[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn cancelled_trial_call_does_not_wedge_the_circuit() {
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.cooldown_ms = 50;
        let (tools, _) = orchestrator(config);
        let flaky = Arc::new(Scripted {
            id: "flaky".into(),
            fail: true,
            delay: Duration::from_millis(30),
            calls: AtomicU32::new(0),
        });
        tools.register("cap", flaky.clone()).await.unwrap();

        let _ = tools.invoke("cap", json!({}), &InvocationContext::default()).await;
        assert_eq!(tools.status().await[0].state, CircuitState::Open);

        // The half-open trial's caller gives up before the adapter answers.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            tools.invoke("cap", json!({}), &InvocationContext::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = tools
            .invoke("cap", json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3, "a new trial reached the adapter");
        match err {
            ToolError::Exhausted { last_error, .. } => assert!(last_error.contains("is down")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_adapter_times_out() {
        let mut config = EngineConfig::default();
        config.tool_timeout_ms = 20;
        let (tools, _) = orchestrator(config);
        tools
            .register(
                "slow",
                Arc::new(Scripted {
                    id: "sloth".into(),
                    fail: false,
                    delay: Duration::from_millis(500),
                    calls: AtomicU32::new(0),
                }),
            )
            .await
            .unwrap();
        let err = tools
            .invoke("slow", json!({}), &InvocationContext::default())
            .await
            .unwrap_err();
        match err {
            ToolError::Exhausted { last_error, .. } => assert!(last_error.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_adapter_ids_are_rejected_and_health_is_reported() {
        let (tools, _) = orchestrator(EngineConfig::default());
        tools.register("lint", Scripted::new("a", false)).await.unwrap();
        tools.register("lint", Scripted::new("b", true)).await.unwrap();
        assert!(tools.register("lint", Scripted::new("a", false)).await.is_err());

        let health = tools.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert!(health[0].healthy);
        assert!(!health[1].healthy);
    }
}
