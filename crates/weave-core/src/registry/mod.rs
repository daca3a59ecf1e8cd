//! Agent registry - which agents exist, what they can do, and whether they
//! are alive.
//!
//! The in-memory map is authoritative for selection; every change is
//! written through to `agent_registrations`. Liveness comes from heartbeats:
//! an agent silent for longer than the heartbeat timeout is `unreachable`
//! and excluded from selection, but never deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::error::ServerError;
use crate::events::EventBus;
use crate::models::agent::{AgentHealth, AgentRegistration, Capability};
use crate::models::event::{
    AgentAnnouncePayload, AgentDeregisterPayload, AgentHeartbeatPayload, Event, EventType,
};
use crate::store::AgentStore;

pub const REGISTRY_HANDLER_ID: &str = "agent-registry";

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentRegistration>>>,
    store: AgentStore,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(store: AgentStore, heartbeat_timeout: Duration) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            store,
            heartbeat_timeout,
        }
    }

    /// Restore persisted registrations that were not deregistered. They
    /// stay selectable only until the sweeper sees their stale heartbeat.
    pub async fn load(&self) -> Result<usize, ServerError> {
        let persisted = self.store.list().await?;
        let mut agents = self.agents.write().await;
        let mut restored = 0;
        for reg in persisted {
            if reg.health == AgentHealth::Unreachable {
                continue;
            }
            agents.insert(reg.agent_id.clone(), reg);
            restored += 1;
        }
        tracing::info!("[Registry] Restored {} agent registrations", restored);
        Ok(restored)
    }

    pub async fn register(
        &self,
        agent_id: &str,
        capabilities: Vec<Capability>,
    ) -> Result<AgentRegistration, ServerError> {
        if agent_id.trim().is_empty() {
            return Err(ServerError::BadRequest("agentId must not be empty".to_string()));
        }
        if capabilities.is_empty() {
            return Err(ServerError::BadRequest(format!(
                "agent {} declares no capabilities",
                agent_id
            )));
        }

        let mut reg = AgentRegistration::new(agent_id.to_string(), capabilities);
        {
            let mut agents = self.agents.write().await;
            // A re-registration keeps the assignments it already carries.
            if let Some(existing) = agents.get(agent_id) {
                reg.in_flight = existing.in_flight;
            }
            agents.insert(agent_id.to_string(), reg.clone());
        }
        self.store.save(&reg).await?;
        tracing::info!(
            "[Registry] Registered agent {} ({})",
            agent_id,
            reg.capabilities
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(reg)
    }

    /// Refresh liveness. `health` defaults to healthy.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        health: Option<AgentHealth>,
    ) -> Result<AgentRegistration, ServerError> {
        let reg = {
            let mut agents = self.agents.write().await;
            let reg = agents
                .get_mut(agent_id)
                .ok_or_else(|| ServerError::NotFound(format!("Agent {} not registered", agent_id)))?;
            let next = health.unwrap_or(AgentHealth::Healthy);
            if reg.health != next {
                tracing::info!(
                    "[Registry] Agent {} is now {}",
                    agent_id,
                    next.as_str()
                );
            }
            reg.health = next;
            reg.last_heartbeat_at = Utc::now();
            reg.clone()
        };
        self.store.save(&reg).await?;
        Ok(reg)
    }

    /// Remove the agent from selection; the persisted row stays as
    /// `unreachable`.
    pub async fn deregister(&self, agent_id: &str) -> Result<bool, ServerError> {
        let removed = self.agents.write().await.remove(agent_id);
        if removed.is_some() {
            self.store
                .update_health(agent_id, AgentHealth::Unreachable)
                .await?;
            tracing::info!("[Registry] Deregistered agent {}", agent_id);
        }
        Ok(removed.is_some())
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All known agents, most recently registered first.
    pub async fn list(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<_> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        all
    }

    /// Selectable agents for a capability, best candidate first. Healthy
    /// agents win; degraded ones are offered only when no healthy agent is
    /// left.
    pub async fn find_healthy(&self, capability: Capability) -> Vec<AgentRegistration> {
        let agents = self.agents.read().await;
        self.candidates(&agents, capability, Utc::now())
    }

    /// Pick the best agent for a capability and count the assignment.
    pub async fn select(&self, capability: Capability) -> Option<AgentRegistration> {
        let mut agents = self.agents.write().await;
        let chosen = self
            .candidates(&agents, capability, Utc::now())
            .into_iter()
            .next()?;
        let entry = agents.get_mut(&chosen.agent_id)?;
        entry.in_flight += 1;
        tracing::debug!(
            "[Registry] Selected {} for {} ({} in flight)",
            entry.agent_id,
            capability,
            entry.in_flight
        );
        Some(entry.clone())
    }

    /// The attempt assigned by `select` ended.
    pub async fn release(&self, agent_id: &str) {
        if let Some(entry) = self.agents.write().await.get_mut(agent_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    fn candidates(
        &self,
        agents: &HashMap<String, AgentRegistration>,
        capability: Capability,
        now: DateTime<Utc>,
    ) -> Vec<AgentRegistration> {
        let live = |reg: &&AgentRegistration| {
            reg.supports(capability) && !self.is_stale(reg, now)
        };
        let mut healthy: Vec<AgentRegistration> = agents
            .values()
            .filter(live)
            .filter(|r| r.health == AgentHealth::Healthy)
            .cloned()
            .collect();
        if healthy.is_empty() {
            healthy = agents
                .values()
                .filter(live)
                .filter(|r| r.health == AgentHealth::Degraded)
                .cloned()
                .collect();
        }
        healthy.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| b.registered_at.cmp(&a.registered_at))
        });
        healthy
    }

    fn is_stale(&self, reg: &AgentRegistration, now: DateTime<Utc>) -> bool {
        let silent = now.signed_duration_since(reg.last_heartbeat_at);
        silent.to_std().map(|d| d > self.heartbeat_timeout).unwrap_or(false)
    }

    /// Mark agents whose heartbeat is overdue as unreachable.
    pub async fn sweep(&self) -> Result<Vec<String>, ServerError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, ServerError> {
        let stale: Vec<String> = {
            let mut agents = self.agents.write().await;
            let mut stale = Vec::new();
            for reg in agents.values_mut() {
                if reg.health != AgentHealth::Unreachable && self.is_stale(reg, now) {
                    reg.health = AgentHealth::Unreachable;
                    stale.push(reg.agent_id.clone());
                }
            }
            stale
        };
        for agent_id in &stale {
            tracing::warn!("[Registry] Agent {} missed its heartbeat, marking unreachable", agent_id);
            self.store
                .update_health(agent_id, AgentHealth::Unreachable)
                .await?;
        }
        Ok(stale)
    }

    // ─── Background tasks ───────────────────────────────────────────────

    /// Apply `agent.register`, `agent.heartbeat` and `agent.deregister`
    /// events from the bus until it closes or `shutdown` flips.
    pub async fn spawn_listener(
        &self,
        bus: &EventBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut sub = bus
            .subscribe_many(
                &[
                    EventType::AgentRegister.topic(),
                    EventType::AgentHeartbeat.topic(),
                    EventType::AgentDeregister.topic(),
                ],
                REGISTRY_HANDLER_ID,
            )
            .await;
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = sub.recv() => match next {
                        Some(event) => {
                            if let Err(e) = registry.apply(&event).await {
                                tracing::warn!(
                                    "[Registry] Ignoring {} event {}: {}",
                                    event.event_type,
                                    event.event_id,
                                    e
                                );
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("[Registry] Listener stopped");
        })
    }

    async fn apply(&self, event: &Event) -> Result<(), ServerError> {
        match event.event_type {
            EventType::AgentRegister => {
                let p: AgentAnnouncePayload = event.decode()?;
                self.register(&p.agent_id, p.capabilities).await?;
            }
            EventType::AgentHeartbeat => {
                let p: AgentHeartbeatPayload = event.decode()?;
                self.heartbeat(&p.agent_id, p.health).await?;
            }
            EventType::AgentDeregister => {
                let p: AgentDeregisterPayload = event.decode()?;
                self.deregister(&p.agent_id).await?;
            }
            other => {
                tracing::debug!("[Registry] Unexpected event type {}", other);
            }
        }
        Ok(())
    }

    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep().await {
                            tracing::error!("[Registry] Sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
