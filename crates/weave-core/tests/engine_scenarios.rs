//! End-to-end engine scenarios with in-process agents on a real bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use weave_core::agent::{Agent, AgentFailure, AgentHandle, AgentOutput, AgentTask, AgentWorker};
use weave_core::config::EngineConfig;
use weave_core::engine::WorkflowDetail;
use weave_core::events::recv_timeout;
use weave_core::models::{
    Capability, ContextScope, Event, EventType, ReasonCode, RetryPolicy, ScopeLevel, Step,
    StepCompletedPayload, StepDefinition, StepFailedPayload, StepStatus, WorkflowDefinition,
    WorkflowStatus,
};
use weave_core::{create_app_state, AppState, Database};

// ─── Harness ────────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
            jitter: 0.0,
        },
        step_timeout_ms: 5_000,
        cancellation_grace_ms: 200,
        agent_wait_interval_ms: 20,
        agent_wait_max_attempts: 200,
        publish_max_attempts: 3,
        ..EngineConfig::default()
    }
}

async fn harness(config: EngineConfig) -> AppState {
    create_app_state(Database::open_in_memory().unwrap(), config)
        .await
        .unwrap()
}

#[derive(Clone)]
enum Script {
    Succeed,
    Fail(&'static str),
    Delay(u64),
    Hang,
}

#[derive(Debug, Clone)]
struct Call {
    step_id: String,
    config: serde_json::Value,
    started: Instant,
    finished: Instant,
}

struct TestAgent {
    id: String,
    capabilities: Vec<Capability>,
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl TestAgent {
    fn new(id: &str, capabilities: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.to_vec(),
            scripts: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn script(mut self, step_id: &str, script: Script) -> Self {
        self.scripts.insert(step_id.to_string(), script);
        self
    }
}

#[async_trait]
impl Agent for TestAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    async fn execute(&self, task: AgentTask) -> Result<AgentOutput, AgentFailure> {
        let started = Instant::now();
        let script = self
            .scripts
            .get(&task.step_id)
            .cloned()
            .unwrap_or(Script::Succeed);
        let outcome = match script {
            Script::Succeed => Ok(()),
            Script::Fail(message) => Err(AgentFailure::new(message)),
            Script::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            }
        };
        self.calls.lock().unwrap().push(Call {
            step_id: task.step_id.clone(),
            config: task.config.clone(),
            started,
            finished: Instant::now(),
        });
        outcome.map(|_| {
            AgentOutput::new(json!({ "step": task.step_id, "attempt": task.attempt }))
                .with_context(ScopeLevel::Feature, &format!("{}.done", task.step_id), json!(true))
        })
    }
}

async fn spawn_agent(state: &AppState, agent: TestAgent) -> AgentHandle {
    let id = agent.id.clone();
    let handle = AgentWorker::new(Arc::new(agent), state.bus.clone())
        .spawn()
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while state.registry.get(&id).await.is_none() {
        assert!(Instant::now() < deadline, "agent {} never registered", id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle
}

async fn wait_for<F>(state: &AppState, workflow_id: &str, what: &str, pred: F) -> WorkflowDetail
where
    F: Fn(&WorkflowDetail) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let detail = state.engine.get(workflow_id).await.unwrap();
        if pred(&detail) {
            return detail;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}; workflow is {} with steps {:?}",
            what,
            detail.workflow.status.as_str(),
            detail
                .steps
                .iter()
                .map(|s| format!("{}={}", s.id, s.status.as_str()))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_finalized(state: &AppState, workflow_id: &str) -> WorkflowDetail {
    wait_for(state, workflow_id, "finalization", |d| d.workflow.is_finalized()).await
}

fn step<'a>(detail: &'a WorkflowDetail, id: &str) -> &'a Step {
    detail.steps.iter().find(|s| s.id == id).unwrap()
}

async fn run(state: &AppState, definition: WorkflowDefinition) -> String {
    let workflow = state.engine.submit(definition).await.unwrap();
    state.engine.execute(&workflow.id).await.unwrap();
    workflow.id
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn fan_out_runs_in_parallel_and_completes() {
    let state = harness(test_config()).await;
    let designer = TestAgent::new("designer", &[Capability::Design]);
    let builder = TestAgent::new("builder", &[Capability::Build])
        .script("b", Script::Delay(150));
    let tester = TestAgent::new("tester", &[Capability::Test]).script("c", Script::Delay(150));
    let builder_calls = builder.calls.clone();
    let tester_calls = tester.calls.clone();
    spawn_agent(&state, designer).await;
    spawn_agent(&state, builder).await;
    spawn_agent(&state, tester).await;

    let mut b = StepDefinition::new("b", "build", &["a"]);
    b.config = json!({ "design": "${steps.a.result}", "note": "after ${steps.a.result}" });
    let mut def = WorkflowDefinition::new(
        "fan-out",
        vec![
            StepDefinition::new("a", "design", &[]),
            b,
            StepDefinition::new("c", "test", &["a"]),
        ],
    );
    def.project_id = Some("payments".into());
    let id = run(&state, def).await;

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Completed);
    for s in &detail.steps {
        assert_eq!(s.status, StepStatus::Succeeded, "step {}", s.id);
        assert_eq!(s.attempt, 1);
    }

    let b_call = builder_calls.lock().unwrap()[0].clone();
    let c_call = tester_calls.lock().unwrap()[0].clone();
    assert!(b_call.started < c_call.finished && c_call.started < b_call.finished);
    assert_eq!(b_call.step_id, "b");
    assert_eq!(b_call.config["design"], json!({ "step": "a", "attempt": 1 }));
    assert!(b_call.config["note"].as_str().unwrap().starts_with("after {"));

    let scope = ContextScope::step("payments", &id, "b");
    let result = state.context.read(&scope, "result", None).await.unwrap().unwrap();
    assert_eq!(result.value["step"], "b");
    assert_eq!(result.writer_id, "builder");
    // Extra write at feature scope is visible from any step of the workflow.
    let seen = state
        .context
        .read_value(&ContextScope::step("payments", &id, "c"), "a.done")
        .await
        .unwrap();
    assert_eq!(seen, Some(json!(true)));

    let types: Vec<EventType> = state
        .engine
        .events(&id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types.first(), Some(&EventType::WorkflowStarted));
    assert_eq!(types.last(), Some(&EventType::WorkflowCompleted));
    assert_eq!(types.iter().filter(|t| **t == EventType::StepDispatch).count(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_workflow_and_skip_dependents() {
    let state = harness(test_config()).await;
    spawn_agent(&state, TestAgent::new("designer", &[Capability::Design])).await;
    let builder = TestAgent::new("builder", &[Capability::Build]).script("b", Script::Fail("compile error"));
    let builder_calls = builder.calls.clone();
    spawn_agent(&state, builder).await;
    spawn_agent(&state, TestAgent::new("releaser", &[Capability::Release])).await;

    let id = run(
        &state,
        WorkflowDefinition::new(
            "doomed",
            vec![
                StepDefinition::new("a", "design", &[]),
                StepDefinition::new("b", "build", &["a"]),
                StepDefinition::new("d", "release", &["b"]),
            ],
        ),
    )
    .await;

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Failed);
    let failure = detail.workflow.failure.clone().unwrap();
    assert_eq!(failure.step_id.as_deref(), Some("b"));
    assert_eq!(failure.code, ReasonCode::AgentError);

    assert_eq!(step(&detail, "a").status, StepStatus::Succeeded);
    let b = step(&detail, "b");
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.attempt, 3);
    assert_eq!(b.error.as_ref().unwrap().message, "compile error");
    let d = step(&detail, "d");
    assert_eq!(d.status, StepStatus::Skipped);
    assert_eq!(d.skip_reason, Some(ReasonCode::UpstreamFailure));
    assert_eq!(builder_calls.lock().unwrap().len(), 3);

    let retries = state
        .engine
        .events(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::StepRetryScheduled)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn cancel_waits_for_grace_then_expires_in_flight_steps() {
    let state = harness(test_config()).await;
    spawn_agent(&state, TestAgent::new("designer", &[Capability::Design])).await;
    spawn_agent(
        &state,
        TestAgent::new("slow", &[Capability::Build, Capability::Test])
            .script("b", Script::Hang)
            .script("c", Script::Hang),
    )
    .await;

    let id = run(
        &state,
        WorkflowDefinition::new(
            "cancel-me",
            vec![
                StepDefinition::new("a", "design", &[]),
                StepDefinition::new("b", "build", &["a"]),
                StepDefinition::new("c", "test", &["a"]),
            ],
        ),
    )
    .await;
    wait_for(&state, &id, "b and c in flight", |d| {
        d.steps.iter().filter(|s| s.is_in_flight()).count() == 2
    })
    .await;

    let cancel_requested = Instant::now();
    state.engine.cancel(&id, Some("operator".into())).await.unwrap();
    let detail = wait_finalized(&state, &id).await;
    assert!(cancel_requested.elapsed() >= Duration::from_millis(200));

    assert_eq!(detail.workflow.status, WorkflowStatus::Cancelled);
    assert_eq!(detail.workflow.failure.as_ref().unwrap().message, "operator");
    assert_eq!(step(&detail, "a").status, StepStatus::Succeeded);
    for id in ["b", "c"] {
        let s = step(&detail, id);
        assert_eq!(s.status, StepStatus::Failed);
        assert_eq!(s.error.as_ref().unwrap().code, ReasonCode::CancelledTimeout);
    }

    // A terminal workflow cannot be cancelled again.
    assert!(state.engine.cancel(&id, None).await.is_err());
}

#[tokio::test]
async fn duplicate_and_late_completions_are_ignored() {
    let state = harness(test_config()).await;
    state
        .registry
        .register("manual", vec![Capability::Build])
        .await
        .unwrap();
    let mut dispatches = state
        .bus
        .subscribe(EventType::StepDispatch.topic(), "manual")
        .await;

    let mut def = WorkflowDefinition::new("once", vec![StepDefinition::new("build", "build", &[])]);
    def.project_id = Some("p".into());
    let id = run(&state, def).await;

    let dispatch = recv_timeout(&mut dispatches, Duration::from_secs(2)).await.unwrap();
    let attempt_id = dispatch.attempt_id.clone().unwrap();
    let completion = |result: serde_json::Value| {
        Event::new(
            EventType::StepCompleted,
            StepCompletedPayload {
                agent_id: Some("manual".into()),
                result,
                context: vec![],
            },
        )
        .for_workflow(&id)
        .for_step("build")
        .with_attempt(&attempt_id)
        .caused_by(&dispatch)
    };

    let first = completion(json!("first"));
    state.bus.emit(&first).await.unwrap();
    state.bus.emit(&first).await.unwrap();
    state.bus.emit(&completion(json!("second"))).await.unwrap();

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Completed);
    let s = step(&detail, "build");
    assert_eq!(s.result, Some(json!("first")));
    assert_eq!(s.attempt, 1);

    // Give any stray redelivery time to land, then check nothing changed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let history = state
        .context
        .history(&ContextScope::step("p", &id, "build"), "result")
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(state.engine.get(&id).await.unwrap().steps[0].result, Some(json!("first")));
}

#[tokio::test]
async fn agent_failure_codes_are_kept_when_agents_may_report_them() {
    let state = harness(test_config()).await;
    state
        .registry
        .register("manual", vec![Capability::Build])
        .await
        .unwrap();
    let mut dispatches = state
        .bus
        .subscribe(EventType::StepDispatch.topic(), "manual")
        .await;

    let mut build = StepDefinition::new("build", "build", &[]);
    build.max_attempts = Some(2);
    let id = run(&state, WorkflowDefinition::new("coded", vec![build])).await;

    let fail_with = |dispatch: &Event, code: ReasonCode| {
        Event::new(
            EventType::StepFailed,
            StepFailedPayload {
                agent_id: Some("manual".into()),
                message: "remote gave up".into(),
                code: Some(code),
            },
        )
        .for_workflow(&id)
        .for_step("build")
        .with_attempt(dispatch.attempt_id.as_deref().unwrap())
        .caused_by(dispatch)
    };

    // Engine-only codes are not the agent's to claim.
    let first = recv_timeout(&mut dispatches, Duration::from_secs(2)).await.unwrap();
    state.bus.emit(&fail_with(&first, ReasonCode::Abandoned)).await.unwrap();

    let second = recv_timeout(&mut dispatches, Duration::from_secs(2)).await.unwrap();
    state.bus.emit(&fail_with(&second, ReasonCode::Timeout)).await.unwrap();

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Failed);
    let build = step(&detail, "build");
    assert_eq!(build.attempt, 2);
    assert_eq!(build.error.as_ref().unwrap().code, ReasonCode::Timeout);

    let events = state.engine.events(&id).await.unwrap();
    let retry = events
        .iter()
        .find(|e| e.event_type == EventType::StepRetryScheduled)
        .unwrap();
    assert_eq!(retry.payload["reason"], "agent-error");
}

#[tokio::test]
async fn step_timeout_counts_as_a_failed_attempt() {
    let state = harness(test_config()).await;
    let hanger = TestAgent::new("hanger", &[Capability::Review]).script("r", Script::Hang);
    let calls = hanger.calls.clone();
    spawn_agent(&state, hanger).await;

    let mut r = StepDefinition::new("r", "review", &[]);
    r.timeout_ms = Some(100);
    r.max_attempts = Some(2);
    let id = run(&state, WorkflowDefinition::new("slow-review", vec![r])).await;

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Failed);
    let r = step(&detail, "r");
    assert_eq!(r.attempt, 2);
    assert_eq!(r.error.as_ref().unwrap().code, ReasonCode::Timeout);
    assert_eq!(detail.workflow.failure.as_ref().unwrap().code, ReasonCode::Timeout);
    // The hung attempts never finished.
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_agent_waits_then_fails_with_no_agent_available() {
    let state = harness(EngineConfig {
        agent_wait_max_attempts: 3,
        ..test_config()
    })
    .await;
    let mut only = StepDefinition::new("ship", "release", &[]);
    only.max_attempts = Some(1);
    let id = run(&state, WorkflowDefinition::new("orphan", vec![only])).await;

    wait_for(&state, &id, "waiting", |d| d.workflow.status != WorkflowStatus::Running).await;
    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Failed);
    let ship = step(&detail, "ship");
    assert_eq!(ship.error.as_ref().unwrap().code, ReasonCode::NoAgentAvailable);
    assert_eq!(ship.attempt, 1);
}

#[tokio::test]
async fn fallback_path_rescues_a_failed_primary() {
    let state = harness(EngineConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            ..test_config().retry
        },
        ..test_config()
    })
    .await;
    spawn_agent(
        &state,
        TestAgent::new("tester", &[Capability::Test]).script("auto", Script::Fail("flaky")),
    )
    .await;
    spawn_agent(&state, TestAgent::new("releaser", &[Capability::Release])).await;

    let mut manual = StepDefinition::new("manual", "test", &[]);
    manual.fallback_for = Some("auto".into());
    let id = run(
        &state,
        WorkflowDefinition::new(
            "rescued",
            vec![
                StepDefinition::new("auto", "test", &[]),
                manual,
                StepDefinition::new("ship", "release", &["auto"]),
            ],
        ),
    )
    .await;

    let detail = wait_finalized(&state, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Completed);
    assert_eq!(step(&detail, "auto").status, StepStatus::Failed);
    assert_eq!(step(&detail, "manual").status, StepStatus::Succeeded);
    assert_eq!(step(&detail, "ship").status, StepStatus::Succeeded);
}

#[tokio::test]
async fn invalid_definitions_never_reach_the_store() {
    let state = harness(test_config()).await;
    let cyclic = WorkflowDefinition::new(
        "loop",
        vec![
            StepDefinition::new("a", "build", &["b"]),
            StepDefinition::new("b", "build", &["a"]),
        ],
    );
    let err = state.engine.submit(cyclic).await.unwrap_err();
    assert_eq!(err.code(), "cyclic-dependency");
    assert!(state.engine.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn restart_resumes_active_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weave.db");
    let path = path.to_str().unwrap();

    let first = create_app_state(Database::open(path).unwrap(), test_config())
        .await
        .unwrap();
    let hanger = spawn_agent(
        &first,
        TestAgent::new("hanger", &[Capability::Build]).script("b", Script::Hang),
    )
    .await;
    let id = run(
        &first,
        WorkflowDefinition::new("survivor", vec![StepDefinition::new("b", "build", &[])]),
    )
    .await;
    wait_for(&first, &id, "b running", |d| d.steps[0].status == StepStatus::Running).await;

    hanger.stop().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while first.registry.get("hanger").await.is_some() {
        assert!(Instant::now() < deadline, "hanger never deregistered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    first.shutdown().await;
    drop(first);

    let second = create_app_state(Database::open(path).unwrap(), test_config())
        .await
        .unwrap();
    assert!(second.registry.get("hanger").await.is_none());
    spawn_agent(&second, TestAgent::new("fixer", &[Capability::Build])).await;

    let detail = wait_finalized(&second, &id).await;
    assert_eq!(detail.workflow.status, WorkflowStatus::Completed);
    let b = step(&detail, "b");
    assert_eq!(b.attempt, 2);
    assert_eq!(b.assigned_agent_id.as_deref(), Some("fixer"));

    let restarted = second
        .engine
        .events(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::StepFailed)
        .any(|e| e.payload["code"] == "engine-restart");
    assert!(restarted);
    second.shutdown().await;
}
