//! Per-workflow supervisor task.
//!
//! The supervisor is the single owner of one workflow's `WorkflowRun`. It
//! suspends on three things only: its inbox (events routed by workflow id),
//! the earliest pending timer, and the engine shutdown signal. Every wake-up
//! ends in `settle()`, which recomputes readiness, dispatches, detects the
//! workflow outcome and persists the run.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::state::{Acceptance, AttemptEnd, WorkflowRun};
use super::template::{self, TemplateVars};
use super::EngineShared;
use crate::models::context::ContextScope;
use crate::models::event::{
    Event, EventType, StepCompletedPayload, StepDispatchPayload, StepFailedPayload,
    WorkflowCancelPayload,
};
use crate::models::step::{ReasonCode, StepError, StepStatus};
use crate::models::workflow::WorkflowStatus;

/// Writer id used for context layers the engine writes on its own behalf.
pub const ENGINE_WRITER_ID: &str = "weave-engine";

#[derive(Debug, Clone)]
enum Timer {
    Retry(usize),
    Timeout { idx: usize, attempt_id: String },
    AgentWait(usize),
    CancelGrace,
}

pub(crate) struct Supervisor {
    run: WorkflowRun,
    shared: EngineShared,
    inbox: mpsc::UnboundedReceiver<Event>,
    shutdown: watch::Receiver<bool>,
    timers: BTreeMap<(Instant, u64), Timer>,
    timer_seq: u64,
    /// Ready steps waiting for an agent; their retry is driven by an
    /// `AgentWait` timer rather than by `settle()`.
    parked: HashSet<usize>,
}

impl Supervisor {
    pub(crate) fn new(
        run: WorkflowRun,
        shared: EngineShared,
        inbox: mpsc::UnboundedReceiver<Event>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run,
            shared,
            inbox,
            shutdown,
            timers: BTreeMap::new(),
            timer_seq: 0,
            parked: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self, resumed: bool) {
        let workflow_id = self.run.workflow.id.clone();
        tracing::info!(
            "[Engine] Supervising workflow {} ({} steps{})",
            workflow_id,
            self.run.steps.len(),
            if resumed { ", resumed" } else { "" }
        );
        if resumed {
            self.recover().await;
        }
        self.settle().await;

        while !self.run.workflow.is_finalized() {
            let deadline = self.timers.keys().next().map(|(at, _)| *at);
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("[Engine] Supervisor for {} stopping on shutdown", workflow_id);
                    break;
                }
                next = self.inbox.recv() => match next {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due().await;
                }
            }
        }

        self.shared.supervisors.write().await.remove(&workflow_id);
        tracing::debug!("[Engine] Supervisor for {} exited", workflow_id);
    }

    // ─── Inbox ──────────────────────────────────────────────────────────

    async fn on_event(&mut self, event: Event) {
        if event.event_type == EventType::WorkflowCancel {
            self.on_cancel(event).await;
            return;
        }

        let idx = match self.run.accept(&event) {
            Acceptance::Accepted(idx) => idx,
            Acceptance::Duplicate => {
                tracing::debug!("[Engine] Duplicate event {} discarded", event.event_id);
                return;
            }
            Acceptance::Stale(why) => {
                tracing::warn!(
                    "[Engine] Discarding {} {} for workflow {}: {}",
                    event.event_type,
                    event.event_id,
                    self.run.workflow.id,
                    why
                );
                return;
            }
        };

        match event.event_type {
            EventType::StepStarted => {
                self.run.mark_running(idx, Utc::now());
            }
            EventType::StepCompleted => self.on_completed(idx, &event).await,
            EventType::StepFailed => {
                let payload: StepFailedPayload = event.decode().unwrap_or_default();
                let message = if payload.message.is_empty() {
                    "agent reported failure".to_string()
                } else {
                    payload.message
                };
                let code = payload
                    .code
                    .filter(ReasonCode::reportable_by_agent)
                    .unwrap_or(ReasonCode::AgentError);
                self.fail_in_flight(idx, StepError::new(code, message), false)
                    .await;
            }
            other => {
                tracing::debug!("[Engine] Ignoring routed {} event", other);
                return;
            }
        }
        self.settle().await;
    }

    async fn on_completed(&mut self, idx: usize, event: &Event) {
        let payload: StepCompletedPayload =
            event.decode().unwrap_or_else(|_| StepCompletedPayload {
                result: event.payload.clone(),
                ..Default::default()
            });
        let agent_id = self.run.steps[idx].assigned_agent_id.clone();
        if let Some(agent_id) = &agent_id {
            self.shared.registry.release(agent_id).await;
        }
        self.run.complete(idx, payload.result.clone(), Utc::now());
        tracing::info!(
            "[Engine] Step {}/{} succeeded (attempt {})",
            self.run.workflow.id,
            self.run.steps[idx].id,
            self.run.steps[idx].attempt
        );

        let writer = agent_id.as_deref().unwrap_or(ENGINE_WRITER_ID);
        let scope = self.step_scope(idx);
        if let Err(e) = self
            .shared
            .context
            .write(&scope, "result", payload.result, writer)
            .await
        {
            tracing::error!("[Engine] Failed to record result of {}: {}", scope, e);
        }
        for write in payload.context {
            let Some(target) = scope.at_level(write.scope) else {
                continue;
            };
            if let Err(e) = self
                .shared
                .context
                .write(&target, &write.key, write.value, writer)
                .await
            {
                tracing::warn!("[Context] Rejected write of {} at {}: {}", write.key, target, e);
            }
        }
    }

    async fn on_cancel(&mut self, event: Event) {
        self.run.mark_seen(&event.event_id);
        let reason = event
            .decode::<WorkflowCancelPayload>()
            .ok()
            .and_then(|p| p.reason);
        let now = Utc::now();
        let Some(skipped) = self.run.cancel(reason, now) else {
            tracing::debug!(
                "[Engine] Cancel of {} ignored in state {}",
                self.run.workflow.id,
                self.run.workflow.status.as_str()
            );
            return;
        };
        self.parked.clear();
        self.publish_skipped(&skipped).await;

        let in_flight = self.run.in_flight().len();
        tracing::info!(
            "[Engine] Workflow {} cancelled, {} steps still in flight",
            self.run.workflow.id,
            in_flight
        );
        if in_flight > 0 {
            let grace = Duration::from_millis(self.shared.config.cancellation_grace_ms);
            self.arm(grace, Timer::CancelGrace);
        }
        self.settle().await;
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    fn arm(&mut self, after: Duration, timer: Timer) {
        self.timer_seq += 1;
        self.timers.insert((Instant::now() + after, self.timer_seq), timer);
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<(Instant, u64)> = self
            .timers
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(timer) = self.timers.remove(&key) {
                self.on_timer(timer).await;
            }
        }
        self.settle().await;
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Retry(idx) => {
                if self.run.retry_due(idx, Utc::now()) {
                    tracing::info!(
                        "[Engine] Retrying step {}/{} (attempt {} of {})",
                        self.run.workflow.id,
                        self.run.steps[idx].id,
                        self.run.steps[idx].attempt + 1,
                        self.run.max_attempts(idx)
                    );
                }
            }
            Timer::Timeout { idx, attempt_id } => {
                let step = &self.run.steps[idx];
                if step.is_in_flight() && step.current_attempt_id.as_deref() == Some(&attempt_id) {
                    let timeout_ms = step.timeout_ms.unwrap_or(self.shared.config.step_timeout_ms);
                    tracing::warn!(
                        "[Engine] Step {}/{} timed out after {}ms",
                        self.run.workflow.id,
                        step.id,
                        timeout_ms
                    );
                    self.fail_in_flight(
                        idx,
                        StepError::new(
                            ReasonCode::Timeout,
                            format!("no terminal event within {}ms", timeout_ms),
                        ),
                        true,
                    )
                    .await;
                }
            }
            Timer::AgentWait(idx) => {
                self.parked.remove(&idx);
                if self.run.workflow.status.is_active()
                    && self.run.steps[idx].status == StepStatus::Ready
                {
                    self.try_dispatch(idx).await;
                }
            }
            Timer::CancelGrace => {
                let now = Utc::now();
                let expired = self.run.expire_cancel(now);
                for (idx, agent_id) in expired {
                    if let Some(agent_id) = &agent_id {
                        self.shared.registry.release(agent_id).await;
                    }
                    tracing::warn!(
                        "[Engine] Step {}/{} still in flight after the cancellation grace period",
                        self.run.workflow.id,
                        self.run.steps[idx].id
                    );
                    self.publish_engine_failure(idx, None).await;
                }
            }
        }
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    fn step_scope(&self, idx: usize) -> ContextScope {
        ContextScope::step(
            &self.run.workflow.project_id,
            &self.run.workflow.id,
            &self.run.steps[idx].id,
        )
    }

    async fn render_config(&self, idx: usize) -> serde_json::Value {
        let config = self.run.steps[idx].config.clone();
        let refs = template::placeholders(&config);
        if refs.context_keys.is_empty() && refs.step_ids.is_empty() {
            return config;
        }
        let scope = self.step_scope(idx);
        let mut vars = TemplateVars::default();
        for key in refs.context_keys {
            match self.shared.context.read_value(&scope, &key).await {
                Ok(Some(value)) => {
                    vars.context.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("[Engine] Context lookup of {} failed: {}", key, e),
            }
        }
        for step_id in refs.step_ids {
            let result = self
                .run
                .index_of(&step_id)
                .and_then(|i| self.run.steps[i].result.clone());
            if let Some(result) = result {
                vars.steps.insert(step_id, result);
            }
        }
        template::render(&config, &vars)
    }

    /// Try to hand a ready step to an agent. Returns true when the step
    /// ended terminally instead (no agent within the wait budget).
    async fn try_dispatch(&mut self, idx: usize) -> bool {
        let capability = self.run.steps[idx].step_type;
        let Some(agent) = self.shared.registry.select(capability).await else {
            return self.park(idx).await;
        };

        let attempt_id = uuid::Uuid::new_v4().to_string();
        let timeout_ms = self.run.steps[idx]
            .timeout_ms
            .unwrap_or(self.shared.config.step_timeout_ms);
        let payload = StepDispatchPayload {
            agent_id: agent.agent_id.clone(),
            capability,
            attempt: self.run.steps[idx].attempt + 1,
            config: self.render_config(idx).await,
            tools: self.shared.tools.bindings(&self.run.steps[idx].tools).await,
            timeout_ms,
        };
        let event = Event::new(EventType::StepDispatch, payload)
            .for_workflow(&self.run.workflow.id)
            .for_step(&self.run.steps[idx].id)
            .with_attempt(&attempt_id);

        let config = &self.shared.config;
        let published = self
            .shared
            .bus
            .publish_with_retry(event.topic(), &event, config.publish_max_attempts, &config.retry)
            .await;
        match published {
            Ok(()) => {
                self.run
                    .begin_attempt(idx, &attempt_id, &agent.agent_id, Utc::now());
                self.arm(
                    Duration::from_millis(timeout_ms),
                    Timer::Timeout { idx, attempt_id },
                );
                tracing::info!(
                    "[Engine] Dispatched {}/{} to {} (attempt {})",
                    self.run.workflow.id,
                    self.run.steps[idx].id,
                    agent.agent_id,
                    self.run.steps[idx].attempt
                );
                false
            }
            Err(e) => {
                self.shared.registry.release(&agent.agent_id).await;
                tracing::warn!(
                    "[Engine] Dispatch of {}/{} not acknowledged: {}",
                    self.run.workflow.id,
                    self.run.steps[idx].id,
                    e
                );
                self.park(idx).await
            }
        }
    }

    async fn park(&mut self, idx: usize) -> bool {
        let max_waits = self.shared.config.agent_wait_max_attempts;
        let step = &mut self.run.steps[idx];
        step.dispatch_waits += 1;
        if step.dispatch_waits >= max_waits {
            tracing::warn!(
                "[Engine] Giving up waiting for a {} agent for {}/{}",
                step.step_type,
                self.run.workflow.id,
                step.id
            );
            self.parked.remove(&idx);
            let end = self.run.give_up_waiting(idx, Utc::now());
            self.publish_engine_failure(idx, None).await;
            return self.after_failure(idx, end).await;
        }
        tracing::warn!(
            "[Engine] No healthy {} agent for {}/{}, waiting ({}/{})",
            step.step_type,
            self.run.workflow.id,
            step.id,
            step.dispatch_waits,
            max_waits
        );
        if self.parked.insert(idx) {
            let wait = Duration::from_millis(self.shared.config.agent_wait_interval_ms);
            self.arm(wait, Timer::AgentWait(idx));
        }
        false
    }

    // ─── Failures ───────────────────────────────────────────────────────

    /// End the in-flight attempt of `idx` with `error`. `engine_reported`
    /// failures are also published as `step.failed`.
    async fn fail_in_flight(&mut self, idx: usize, error: StepError, engine_reported: bool) {
        let attempt_id = self.run.steps[idx].current_attempt_id.clone();
        if let Some(agent_id) = self.run.steps[idx].assigned_agent_id.clone() {
            self.shared.registry.release(&agent_id).await;
        }
        let end = self.run.fail_attempt(idx, error, Utc::now());
        if engine_reported {
            self.publish_engine_failure(idx, attempt_id.as_deref()).await;
        }
        self.after_failure(idx, end).await;
    }

    async fn after_failure(&mut self, idx: usize, end: AttemptEnd) -> bool {
        let step = &self.run.steps[idx];
        let code = step.error.as_ref().map(|e| e.code).unwrap_or(ReasonCode::AgentError);
        match end {
            AttemptEnd::Retry { delay } => {
                tracing::warn!(
                    "[Engine] Step {}/{} failed ({}), attempt {} of {}; retrying in {:?}",
                    self.run.workflow.id,
                    step.id,
                    code,
                    step.attempt,
                    self.run.max_attempts(idx),
                    delay
                );
                let event = Event::new(
                    EventType::StepRetryScheduled,
                    json!({
                        "attempt": step.attempt,
                        "delayMs": delay.as_millis() as u64,
                        "reason": code,
                    }),
                )
                .for_workflow(&self.run.workflow.id)
                .for_step(&step.id);
                self.arm(delay, Timer::Retry(idx));
                self.publish(event).await;
                false
            }
            AttemptEnd::Terminal => {
                tracing::warn!(
                    "[Engine] Step {}/{} failed terminally ({}) after {} attempts",
                    self.run.workflow.id,
                    step.id,
                    code,
                    step.attempt
                );
                true
            }
        }
    }

    /// Failures the engine decides on are journaled like agent failures.
    async fn publish_engine_failure(&mut self, idx: usize, attempt_id: Option<&str>) {
        let step = &self.run.steps[idx];
        let (code, message) = step
            .error
            .as_ref()
            .map(|e| (e.code, e.message.clone()))
            .unwrap_or((ReasonCode::AgentError, String::new()));
        let mut event = Event::new(
            EventType::StepFailed,
            StepFailedPayload {
                agent_id: step.assigned_agent_id.clone(),
                message,
                code: Some(code),
            },
        )
        .for_workflow(&self.run.workflow.id)
        .for_step(&step.id);
        if let Some(attempt_id) = attempt_id {
            event = event.with_attempt(attempt_id);
        }
        self.run.mark_seen(&event.event_id);
        self.publish(event).await;
    }

    async fn publish_skipped(&self, skipped: &[usize]) {
        for &idx in skipped {
            let step = &self.run.steps[idx];
            tracing::info!(
                "[Engine] Step {}/{} skipped ({})",
                self.run.workflow.id,
                step.id,
                step.skip_reason.map(|r| r.as_str()).unwrap_or("-")
            );
            let event = Event::new(EventType::StepSkipped, json!({ "reason": step.skip_reason }))
                .for_workflow(&self.run.workflow.id)
                .for_step(&step.id);
            self.publish(event).await;
        }
    }

    async fn publish(&self, event: Event) {
        let config = &self.shared.config;
        if let Err(e) = self
            .shared
            .bus
            .publish_with_retry(event.topic(), &event, config.publish_max_attempts, &config.retry)
            .await
        {
            tracing::warn!(
                "[Engine] Could not publish {} for workflow {}: {}",
                event.event_type,
                self.run.workflow.id,
                e
            );
        }
    }

    // ─── Settle ─────────────────────────────────────────────────────────

    async fn settle(&mut self) {
        while self.run.workflow.status.is_active() {
            let now = Utc::now();
            let skipped = self.run.advance(now);
            self.publish_skipped(&skipped).await;

            if let Some(cause) = self.run.fatal_failure() {
                self.fail_workflow(cause).await;
                break;
            }

            let mut again = false;
            for idx in self.run.dispatchable() {
                if self.parked.contains(&idx) {
                    continue;
                }
                again |= self.try_dispatch(idx).await;
            }
            if again {
                continue;
            }

            if self.run.all_terminal() {
                if self.run.complete_workflow(Utc::now()) {
                    tracing::info!("[Engine] Workflow {} completed", self.run.workflow.id);
                    let event = Event::new(EventType::WorkflowCompleted, json!({}))
                        .for_workflow(&self.run.workflow.id);
                    self.publish(event).await;
                }
            } else if let Some(status) = self.run.refresh_activity(Utc::now()) {
                tracing::info!(
                    "[Engine] Workflow {} is {}",
                    self.run.workflow.id,
                    status.as_str()
                );
            }
            break;
        }

        if self.run.workflow.status == WorkflowStatus::Cancelled
            && !self.run.workflow.is_finalized()
            && self.run.in_flight().is_empty()
        {
            self.run.finalize(Utc::now());
            tracing::info!("[Engine] Workflow {} finalized as cancelled", self.run.workflow.id);
            let event = Event::new(EventType::WorkflowCancelled, &self.run.workflow.failure)
                .for_workflow(&self.run.workflow.id);
            self.publish(event).await;
        }

        self.persist().await;
    }

    async fn fail_workflow(&mut self, cause: usize) {
        let now = Utc::now();
        let sweep = self.run.fail_workflow(cause, now);
        self.parked.clear();
        self.publish_skipped(&sweep.skipped).await;
        for (idx, agent_id) in sweep.abandoned {
            if let Some(agent_id) = &agent_id {
                self.shared.registry.release(agent_id).await;
            }
            self.publish_engine_failure(idx, None).await;
        }
        self.run.finalize(now);
        tracing::warn!(
            "[Engine] Workflow {} failed: {}",
            self.run.workflow.id,
            self.run
                .workflow
                .failure
                .as_ref()
                .map(|f| f.message.as_str())
                .unwrap_or("-")
        );
        let event = Event::new(EventType::WorkflowFailed, &self.run.workflow.failure)
            .for_workflow(&self.run.workflow.id);
        self.publish(event).await;
    }

    async fn persist(&self) {
        if let Err(e) = self
            .shared
            .store
            .save_run(&self.run.workflow, &self.run.steps)
            .await
        {
            tracing::error!("[Engine] Failed to persist workflow {}: {}", self.run.workflow.id, e);
        }
    }

    // ─── Recovery ───────────────────────────────────────────────────────

    /// Re-arm state lost with the previous process: pending backoffs get
    /// their timers back, in-flight attempts are failed.
    async fn recover(&mut self) {
        let now = Utc::now();
        for idx in 0..self.run.steps.len() {
            if let Some(at) = self.run.steps[idx].next_retry_at {
                let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
                self.arm(remaining, Timer::Retry(idx));
            }
        }
        for (idx, end) in self.run.recover_in_flight(now) {
            tracing::warn!(
                "[Engine] Step {}/{} lost its attempt to an engine restart",
                self.run.workflow.id,
                self.run.steps[idx].id
            );
            self.publish_engine_failure(idx, None).await;
            self.after_failure(idx, end).await;
        }
    }
}
