//! Workflow/step state machine.
//!
//! `WorkflowRun` is plain data plus transitions; it performs no I/O. The
//! supervisor owns one run per active workflow and turns the transitions'
//! results into bus events, timers and persistence.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::backoff;
use super::dag::StepGraph;
use crate::error::ValidationError;
use crate::models::event::Event;
use crate::models::step::{ReasonCode, Step, StepError, StepStatus};
use crate::models::workflow::{Workflow, WorkflowFailure, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepOutcome {
    Satisfied,
    Failed,
    Pending,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Acceptance {
    Accepted(usize),
    Duplicate,
    Stale(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptEnd {
    Retry { delay: Duration },
    Terminal,
}

/// Steps touched while failing a workflow.
#[derive(Debug, Default)]
pub struct FailureSweep {
    pub skipped: Vec<usize>,
    /// In-flight steps abandoned, with the agent they were assigned to.
    pub abandoned: Vec<(usize, Option<String>)>,
}

pub struct WorkflowRun {
    pub workflow: Workflow,
    pub steps: Vec<Step>,
    graph: StepGraph,
    seen: HashSet<String>,
}

impl WorkflowRun {
    pub fn new(workflow: Workflow, mut steps: Vec<Step>) -> Result<Self, ValidationError> {
        let graph = StepGraph::build(&workflow.definition)?;
        steps.sort_by_key(|s| s.index);
        if steps.len() != graph.len() {
            return Err(ValidationError::Malformed(format!(
                "workflow {} has {} step rows for {} defined steps",
                workflow.id,
                steps.len(),
                graph.len()
            )));
        }
        Ok(Self {
            workflow,
            steps,
            graph,
            seen: HashSet::new(),
        })
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.graph.index_of(step_id)
    }

    pub fn max_attempts(&self, idx: usize) -> u32 {
        self.steps[idx]
            .max_attempts
            .unwrap_or(self.workflow.retry.max_attempts)
            .max(1)
    }

    fn transition(&mut self, next: WorkflowStatus, now: DateTime<Utc>) -> bool {
        if !self.workflow.status.can_transition_to(next) {
            return false;
        }
        self.workflow.status = next;
        self.workflow.updated_at = now;
        true
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.workflow.status != WorkflowStatus::Draft {
            return false;
        }
        self.transition(WorkflowStatus::Running, now);
        self.workflow.started_at = Some(now);
        true
    }

    // ─── Readiness ──────────────────────────────────────────────────────

    /// How a finished (or unfinished) dependency looks to its dependents.
    fn outcome(&self, idx: usize) -> DepOutcome {
        let step = &self.steps[idx];
        match step.status {
            StepStatus::Succeeded => DepOutcome::Satisfied,
            StepStatus::Skipped => {
                let blocking = step.skip_reason.map(|r| r.blocks_dependents()).unwrap_or(false);
                if !blocking {
                    DepOutcome::Satisfied
                } else if let Some(f) = self.graph.fallback_of(idx) {
                    self.fallback_outcome(f)
                } else if !step.required {
                    DepOutcome::Satisfied
                } else {
                    DepOutcome::Failed
                }
            }
            StepStatus::Failed if step.next_retry_at.is_none() => match self.graph.fallback_of(idx) {
                Some(f) => self.fallback_outcome(f),
                None => DepOutcome::Failed,
            },
            _ => DepOutcome::Pending,
        }
    }

    fn fallback_outcome(&self, f: usize) -> DepOutcome {
        let step = &self.steps[f];
        match step.status {
            StepStatus::Succeeded => DepOutcome::Satisfied,
            StepStatus::Skipped => match self.graph.fallback_of(f) {
                Some(next) => self.fallback_outcome(next),
                None => DepOutcome::Failed,
            },
            StepStatus::Failed if step.next_retry_at.is_none() => match self.graph.fallback_of(f) {
                Some(next) => self.fallback_outcome(next),
                None => DepOutcome::Failed,
            },
            _ => DepOutcome::Pending,
        }
    }

    fn skip(&mut self, idx: usize, reason: ReasonCode, now: DateTime<Utc>) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Skipped;
        step.skip_reason = Some(reason);
        step.updated_at = now;
    }

    /// Promote pending steps whose dependencies are decided: to `ready` when
    /// satisfied, to `skipped` otherwise. Returns the newly skipped steps.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<usize> {
        let mut skipped = Vec::new();
        if !self.workflow.status.is_active() {
            return skipped;
        }
        loop {
            let mut changed = false;
            for pos in 0..self.graph.order().len() {
                let i = self.graph.order()[pos];
                if self.steps[i].status != StepStatus::Pending {
                    continue;
                }

                if let Some(p) = self.graph.primary_of(i) {
                    let primary = &self.steps[p];
                    match primary.status {
                        StepStatus::Succeeded => {
                            self.skip(i, ReasonCode::FallbackNotNeeded, now);
                            skipped.push(i);
                            changed = true;
                            continue;
                        }
                        StepStatus::Skipped
                            if !primary.skip_reason.map(|r| r.blocks_dependents()).unwrap_or(false) =>
                        {
                            self.skip(i, ReasonCode::FallbackNotNeeded, now);
                            skipped.push(i);
                            changed = true;
                            continue;
                        }
                        StepStatus::Skipped => {}
                        StepStatus::Failed if primary.next_retry_at.is_none() => {}
                        _ => continue,
                    }
                }

                let mut pending = false;
                let mut failed = false;
                for &d in self.graph.deps(i) {
                    match self.outcome(d) {
                        DepOutcome::Pending => pending = true,
                        DepOutcome::Failed => failed = true,
                        DepOutcome::Satisfied => {}
                    }
                }
                if pending {
                    continue;
                }
                if failed && !self.steps[i].continue_on_failure {
                    self.skip(i, ReasonCode::UpstreamFailure, now);
                    skipped.push(i);
                } else {
                    self.steps[i].status = StepStatus::Ready;
                    self.steps[i].updated_at = now;
                }
                changed = true;
            }
            if !changed {
                break;
            }
        }
        skipped
    }

    /// Ready steps in topological order. Empty unless the workflow is active.
    pub fn dispatchable(&self) -> Vec<usize> {
        if !self.workflow.status.is_active() {
            return Vec::new();
        }
        self.graph
            .order()
            .iter()
            .copied()
            .filter(|&i| self.steps[i].status == StepStatus::Ready)
            .collect()
    }

    // ─── Attempts ───────────────────────────────────────────────────────

    pub fn begin_attempt(
        &mut self,
        idx: usize,
        attempt_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Dispatched;
        step.attempt += 1;
        step.current_attempt_id = Some(attempt_id.to_string());
        step.assigned_agent_id = Some(agent_id.to_string());
        step.error = None;
        step.dispatch_waits = 0;
        step.updated_at = now;
    }

    pub fn mark_seen(&mut self, event_id: &str) {
        self.seen.insert(event_id.to_string());
    }

    /// Decide whether an agent event applies to the current attempt of a
    /// step. Each event id is only ever accepted once.
    pub fn accept(&mut self, event: &Event) -> Acceptance {
        if !self.seen.insert(event.event_id.clone()) {
            return Acceptance::Duplicate;
        }
        if self.workflow.is_finalized() {
            return Acceptance::Stale(format!("workflow {} is finalized", self.workflow.id));
        }
        let Some(step_id) = event.step_id.as_deref() else {
            return Acceptance::Stale("event carries no stepId".to_string());
        };
        let Some(idx) = self.index_of(step_id) else {
            return Acceptance::Stale(format!("unknown step {}", step_id));
        };
        let step = &self.steps[idx];
        if !step.is_in_flight() {
            return Acceptance::Stale(format!(
                "step {} is {}",
                step_id,
                step.status.as_str()
            ));
        }
        if step.current_attempt_id.is_none()
            || step.current_attempt_id.as_deref() != event.attempt_id.as_deref()
        {
            return Acceptance::Stale(format!(
                "attempt {} is not the current attempt of {}",
                event.attempt_id.as_deref().unwrap_or("-"),
                step_id
            ));
        }
        Acceptance::Accepted(idx)
    }

    pub fn mark_running(&mut self, idx: usize, now: DateTime<Utc>) -> bool {
        let step = &mut self.steps[idx];
        if step.status != StepStatus::Dispatched {
            return false;
        }
        step.status = StepStatus::Running;
        step.updated_at = now;
        true
    }

    pub fn complete(&mut self, idx: usize, result: serde_json::Value, now: DateTime<Utc>) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Succeeded;
        step.result = Some(result);
        step.error = None;
        step.current_attempt_id = None;
        step.next_retry_at = None;
        step.updated_at = now;
    }

    /// End the current attempt of an in-flight step with a failure.
    pub fn fail_attempt(&mut self, idx: usize, error: StepError, now: DateTime<Utc>) -> AttemptEnd {
        self.record_failure(idx, error, now)
    }

    /// A ready step found no agent within the wait budget. The wait counts
    /// as a failed attempt.
    pub fn give_up_waiting(&mut self, idx: usize, now: DateTime<Utc>) -> AttemptEnd {
        let waits = self.steps[idx].dispatch_waits;
        let capability = self.steps[idx].step_type;
        self.steps[idx].attempt += 1;
        self.record_failure(
            idx,
            StepError::new(
                ReasonCode::NoAgentAvailable,
                format!("no healthy {} agent after {} waits", capability, waits),
            ),
            now,
        )
    }

    fn record_failure(&mut self, idx: usize, error: StepError, now: DateTime<Utc>) -> AttemptEnd {
        let retry_allowed = self.workflow.status.is_active();
        let max = self.max_attempts(idx);
        let policy = self.workflow.retry.clone();
        let step = &mut self.steps[idx];
        step.status = StepStatus::Failed;
        step.error = Some(error);
        step.current_attempt_id = None;
        step.dispatch_waits = 0;
        step.updated_at = now;

        if retry_allowed && step.attempt < max {
            let delay = backoff::delay(&policy, step.attempt);
            step.next_retry_at = Some(
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
            AttemptEnd::Retry { delay }
        } else {
            step.next_retry_at = None;
            AttemptEnd::Terminal
        }
    }

    /// Backoff elapsed: the step goes back to `ready`.
    pub fn retry_due(&mut self, idx: usize, now: DateTime<Utc>) -> bool {
        if !self.workflow.status.is_active() || !self.steps[idx].awaiting_retry() {
            return false;
        }
        let step = &mut self.steps[idx];
        step.status = StepStatus::Ready;
        step.next_retry_at = None;
        step.updated_at = now;
        true
    }

    // ─── Workflow outcome ───────────────────────────────────────────────

    /// A required step that terminally failed with no successful fallback.
    pub fn fatal_failure(&self) -> Option<usize> {
        self.graph.order().iter().copied().find(|&i| {
            let step = &self.steps[i];
            step.required
                && step.status == StepStatus::Failed
                && step.next_retry_at.is_none()
                && self.outcome(i) == DepOutcome::Failed
        })
    }

    /// Fail the workflow because of step `cause`: nothing else gets
    /// dispatched, pending work is skipped and in-flight work abandoned.
    pub fn fail_workflow(&mut self, cause: usize, now: DateTime<Utc>) -> FailureSweep {
        let downstream = self.graph.transitive_dependents(cause);
        let mut sweep = FailureSweep::default();
        for i in 0..self.steps.len() {
            let step = &mut self.steps[i];
            match step.status {
                StepStatus::Pending | StepStatus::Ready => {
                    let reason = if downstream.contains(&i) {
                        ReasonCode::UpstreamFailure
                    } else {
                        ReasonCode::WorkflowFailed
                    };
                    self.skip(i, reason, now);
                    sweep.skipped.push(i);
                }
                StepStatus::Dispatched | StepStatus::Running => {
                    step.status = StepStatus::Failed;
                    step.error = Some(StepError::new(
                        ReasonCode::Abandoned,
                        "workflow failed while the step was in flight",
                    ));
                    step.current_attempt_id = None;
                    step.next_retry_at = None;
                    step.updated_at = now;
                    sweep.abandoned.push((i, step.assigned_agent_id.clone()));
                }
                StepStatus::Failed if step.next_retry_at.is_some() => {
                    step.next_retry_at = None;
                    step.error = Some(StepError::new(
                        ReasonCode::WorkflowFailed,
                        "workflow failed before the retry was due",
                    ));
                    step.updated_at = now;
                }
                _ => {}
            }
        }

        let failed = &self.steps[cause];
        let code = failed
            .error
            .as_ref()
            .map(|e| e.code)
            .unwrap_or(ReasonCode::AgentError);
        let message = failed
            .error
            .as_ref()
            .map(|e| format!("step {} failed: {}", failed.id, e.message))
            .unwrap_or_else(|| format!("step {} failed", failed.id));
        self.workflow.failure = Some(WorkflowFailure {
            code,
            step_id: Some(failed.id.clone()),
            message,
        });
        self.transition(WorkflowStatus::Failed, now);
        self.workflow.completed_at = Some(now);
        sweep
    }

    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.is_terminal())
    }

    pub fn complete_workflow(&mut self, now: DateTime<Utc>) -> bool {
        if !self.transition(WorkflowStatus::Completed, now) {
            return false;
        }
        self.workflow.completed_at = Some(now);
        true
    }

    pub fn in_flight(&self) -> Vec<usize> {
        (0..self.steps.len())
            .filter(|&i| self.steps[i].is_in_flight())
            .collect()
    }

    /// Flip between `running` and `waiting`: waiting means nothing is in
    /// flight while steps are still parked. Returns the new status if it
    /// changed.
    pub fn refresh_activity(&mut self, now: DateTime<Utc>) -> Option<WorkflowStatus> {
        if !self.workflow.status.is_active() {
            return None;
        }
        let next = if self.steps.iter().any(|s| s.is_in_flight()) {
            WorkflowStatus::Running
        } else if self.all_terminal() {
            return None;
        } else {
            WorkflowStatus::Waiting
        };
        if next != self.workflow.status && self.transition(next, now) {
            Some(next)
        } else {
            None
        }
    }

    // ─── Cancellation ───────────────────────────────────────────────────

    /// Stop all new work. Returns the steps skipped by the cancel; in-flight
    /// steps keep running until they report or the grace period expires.
    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Option<Vec<usize>> {
        if !self.transition(WorkflowStatus::Cancelled, now) {
            return None;
        }
        self.workflow.failure = Some(WorkflowFailure {
            code: ReasonCode::Cancelled,
            step_id: None,
            message: reason.unwrap_or_else(|| "cancelled by request".to_string()),
        });
        let mut skipped = Vec::new();
        for i in 0..self.steps.len() {
            match self.steps[i].status {
                StepStatus::Pending | StepStatus::Ready => {
                    self.skip(i, ReasonCode::Cancelled, now);
                    skipped.push(i);
                }
                StepStatus::Failed if self.steps[i].next_retry_at.is_some() => {
                    let step = &mut self.steps[i];
                    step.next_retry_at = None;
                    step.error = Some(StepError::new(
                        ReasonCode::Cancelled,
                        "workflow cancelled before the retry was due",
                    ));
                    step.updated_at = now;
                }
                _ => {}
            }
        }
        Some(skipped)
    }

    /// Grace period over: whatever is still in flight is failed.
    pub fn expire_cancel(&mut self, now: DateTime<Utc>) -> Vec<(usize, Option<String>)> {
        let mut expired = Vec::new();
        for i in self.in_flight() {
            let step = &mut self.steps[i];
            step.status = StepStatus::Failed;
            step.error = Some(StepError::new(
                ReasonCode::CancelledTimeout,
                "step did not finish within the cancellation grace period",
            ));
            step.current_attempt_id = None;
            step.next_retry_at = None;
            step.updated_at = now;
            expired.push((i, step.assigned_agent_id.clone()));
        }
        expired
    }

    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if self.workflow.completed_at.is_none() {
            self.workflow.completed_at = Some(now);
            self.workflow.updated_at = now;
        }
    }

    // ─── Recovery ───────────────────────────────────────────────────────

    /// After an engine restart nobody is waiting for the attempts that were
    /// in flight; they fail with `engine-restart` and follow the retry path.
    pub fn recover_in_flight(&mut self, now: DateTime<Utc>) -> Vec<(usize, AttemptEnd)> {
        let mut out = Vec::new();
        for i in self.in_flight() {
            let end = self.record_failure(
                i,
                StepError::new(ReasonCode::EngineRestart, "engine restarted during the attempt"),
                now,
            );
            out.push((i, end));
        }
        out
    }
}
