//! Integration test: start the HTTP server on a random port and drive the
//! API the way an external agent and an operator would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use weave_core::agent::{Agent, AgentFailure, AgentOutput, AgentTask, AgentWorker};
use weave_core::events::recv_timeout;
use weave_core::models::{Capability, EventType};
use weave_core::tools::{ToolAdapter, ToolError};
use weave_core::{Database, EngineConfig};
use weave_server::state::AppState;

async fn spawn_server(config: EngineConfig) -> (AppState, String) {
    let db = Database::open_in_memory().unwrap();
    let state = weave_core::create_app_state(db, config).await.unwrap();
    let app = weave_server::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (state, format!("http://{}", addr))
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 2;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_cap_ms = 50;
    config.retry.jitter = 0.0;
    config.cancellation_grace_ms = 200;
    config.agent_wait_interval_ms = 20;
    config.agent_wait_max_attempts = 200;
    config
}

async fn wait_for_status(
    client: &reqwest::Client,
    base_url: &str,
    workflow_id: &str,
    wanted: &str,
) -> serde_json::Value {
    for _ in 0..500 {
        let body: serde_json::Value = client
            .get(format!("{}/workflows/{}", base_url, workflow_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} never reached {}", workflow_id, wanted);
}

#[tokio::test]
async fn test_http_agent_round_trip() {
    let (state, base_url) = spawn_server(fast_config()).await;
    let client = reqwest::Client::new();

    // ── Test 1: Health Check ──────────────────────────────────────
    println!("=== Test 1: Health Check ===");
    let resp = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    println!("  PASS: {}", body);

    // ── Test 2: Cyclic definition is rejected ─────────────────────
    println!("=== Test 2: Validate cyclic definition ===");
    let resp = client
        .post(format!("{}/workflows/validate", base_url))
        .json(&json!({
            "definition": {
                "name": "loop",
                "steps": [
                    { "id": "a", "type": "build", "dependsOn": ["b"] },
                    { "id": "b", "type": "test", "dependsOn": ["a"] }
                ]
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "cyclic-dependency");
    let resp = client
        .post(format!("{}/workflows", base_url))
        .json(&json!({
            "definition": {
                "name": "loop",
                "steps": [{ "id": "a", "type": "build", "dependsOn": ["a"] }]
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: serde_json::Value = client
        .get(format!("{}/workflows", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["workflows"].as_array().unwrap().len(), 0);
    println!("  PASS: rejected and nothing stored");

    // ── Test 3: Register an HTTP agent ────────────────────────────
    println!("=== Test 3: Register agent ===");
    let resp = client
        .post(format!("{}/agents", base_url))
        .json(&json!({ "agentId": "http-builder", "capabilities": ["build"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["health"], "healthy");
    let resp = client
        .post(format!("{}/agents", base_url))
        .json(&json!({ "agentId": "bad", "capabilities": ["juggling"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = client
        .get(format!("{}/agents?capability=build", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["agents"].as_array().unwrap().len(), 1);
    println!("  PASS: http-builder registered");

    // The agent's side of the bus: dispatches addressed to it.
    let mut dispatches = state
        .bus
        .subscribe(EventType::StepDispatch.topic(), "agent:http-builder")
        .await;

    // ── Test 4: Submit and execute ────────────────────────────────
    println!("=== Test 4: Submit and execute ===");
    let resp = client
        .post(format!("{}/workflows", base_url))
        .json(&json!({
            "definition": {
                "name": "compile-only",
                "projectId": "payments",
                "steps": [{ "id": "compile", "type": "build", "config": { "target": "x86_64" } }]
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "draft");
    let workflow_id = body["workflowId"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/workflows/{}/execute", base_url, workflow_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "running");
    println!("  PASS: workflow {} running", workflow_id);

    // ── Test 5: Agent reports over HTTP ───────────────────────────
    println!("=== Test 5: Publish step events ===");
    let dispatch = recv_timeout(&mut dispatches, Duration::from_secs(5))
        .await
        .expect("dispatch");
    assert_eq!(dispatch.step_id.as_deref(), Some("compile"));
    assert_eq!(dispatch.payload["config"]["target"], "x86_64");
    let attempt_id = dispatch.attempt_id.clone().unwrap();

    let resp = client
        .post(format!("{}/events", base_url))
        .json(&json!({
            "type": "step.started",
            "workflowId": workflow_id,
            "stepId": "compile",
            "attemptId": attempt_id,
            "causationId": dispatch.event_id,
            "payload": { "agentId": "http-builder" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let completion = json!({
        "eventId": "done-compile-1",
        "type": "step.completed",
        "workflowId": workflow_id,
        "stepId": "compile",
        "attemptId": attempt_id,
        "causationId": dispatch.event_id,
        "payload": { "agentId": "http-builder", "result": { "artifact": "app.bin" } }
    });
    let resp = client
        .post(format!("{}/events", base_url))
        .json(&completion)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let body = wait_for_status(&client, &base_url, &workflow_id, "completed").await;
    assert_eq!(body["steps"][0]["status"], "succeeded");
    assert_eq!(body["steps"][0]["result"]["artifact"], "app.bin");
    println!("  PASS: workflow completed");

    // ── Test 6: Duplicate completion is harmless ──────────────────
    println!("=== Test 6: Duplicate completion ===");
    let resp = client
        .post(format!("{}/events", base_url))
        .json(&completion)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let body = wait_for_status(&client, &base_url, &workflow_id, "completed").await;
    assert_eq!(body["steps"][0]["attempt"], 1);
    println!("  PASS: still completed after one attempt");

    // ── Test 7: Engine-owned events are refused ───────────────────
    println!("=== Test 7: Engine-owned event types ===");
    let resp = client
        .post(format!("{}/events", base_url))
        .json(&json!({ "type": "workflow.completed", "workflowId": workflow_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    println!("  PASS: workflow.completed refused");

    // ── Test 8: Journal replay ────────────────────────────────────
    println!("=== Test 8: Journal replay ===");
    let body: serde_json::Value = client
        .get(format!("{}/workflows/{}/events", base_url, workflow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let types: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(types.first(), Some(&"workflow.started"));
    assert!(types.contains(&"step.dispatch"));
    assert!(types.contains(&"step.completed"));
    assert_eq!(types.last(), Some(&"workflow.completed"));
    println!("  PASS: {} events", types.len());

    // ── Test 9: Step result is visible in context ─────────────────
    println!("=== Test 9: Step result in context ===");
    let resp = client
        .get(format!("{}/context", base_url))
        .query(&[
            ("scope", format!("step/payments/{}/compile", workflow_id)),
            ("key", "result".to_string()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["layer"]["value"]["artifact"], "app.bin");
    assert_eq!(body["layer"]["writerId"], "http-builder");
    println!("  PASS: {}", body["layer"]["value"]);

    // ── Test 10: Terminal workflows cannot be cancelled ───────────
    println!("=== Test 10: Cancel completed workflow ===");
    let resp = client
        .post(format!("{}/workflows/{}/cancel", base_url, workflow_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    println!("  PASS: 409");

    // ── Test 11: Deregister ───────────────────────────────────────
    println!("=== Test 11: Deregister agent ===");
    let resp = client
        .delete(format!("{}/agents/http-builder", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{}/agents/http-builder/heartbeat", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    println!("  PASS: deregistered");

    state.shutdown().await;
}

struct HangingAgent;

#[async_trait]
impl Agent for HangingAgent {
    fn id(&self) -> &str {
        "slow-tester"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Test]
    }

    async fn execute(&self, _task: AgentTask) -> Result<AgentOutput, AgentFailure> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(AgentOutput::new(json!("too late")))
    }
}

#[tokio::test]
async fn test_cancel_expires_in_flight_steps() {
    let (state, base_url) = spawn_server(fast_config()).await;
    let client = reqwest::Client::new();

    let handle = AgentWorker::new(Arc::new(HangingAgent), state.bus.clone())
        .spawn()
        .await
        .unwrap();
    for _ in 0..100 {
        if state.registry.get("slow-tester").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    println!("=== Test 1: Submit with execute ===");
    let body: serde_json::Value = client
        .post(format!("{}/workflows", base_url))
        .json(&json!({
            "definition": {
                "name": "suite",
                "steps": [
                    { "id": "unit", "type": "test" },
                    { "id": "integration", "type": "test" },
                    { "id": "report", "type": "test", "dependsOn": ["unit", "integration"] }
                ]
            },
            "execute": true
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "running");
    let workflow_id = body["workflowId"].as_str().unwrap().to_string();
    println!("  PASS: {}", workflow_id);

    println!("=== Test 2: Cancel running workflow ===");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = client
        .post(format!("{}/workflows/{}/cancel", base_url, workflow_id))
        .json(&json!({ "reason": "release frozen" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let body = wait_for_status(&client, &base_url, &workflow_id, "cancelled").await;
    let mut ended = Vec::new();
    for _ in 0..300 {
        let body: serde_json::Value = client
            .get(format!("{}/workflows/{}", base_url, workflow_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["completedAt"].is_string() {
            ended = body["steps"].as_array().unwrap().clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(body["failure"]["code"], "cancelled");
    assert_eq!(ended.len(), 3);
    for step in &ended[..2] {
        assert_eq!(step["status"], "failed");
        assert_eq!(step["error"]["code"], "cancelled-timeout");
    }
    assert_eq!(ended[2]["status"], "skipped");
    println!("  PASS: in-flight steps expired after grace");

    handle.stop().await;
    state.shutdown().await;
}

struct FlakyLinter {
    id: &'static str,
    fail: bool,
}

#[async_trait]
impl ToolAdapter for FlakyLinter {
    fn id(&self) -> &str {
        self.id
    }

    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        if self.fail {
            return Err(ToolError::Failed("linter crashed".to_string()));
        }
        Ok(json!({ "linted": args["path"], "by": self.id }))
    }
}

#[tokio::test]
async fn test_context_and_tools() {
    let (state, base_url) = spawn_server(fast_config()).await;
    let client = reqwest::Client::new();

    println!("=== Test 1: Layered context ===");
    let resp = client
        .post(format!("{}/context", base_url))
        .json(&json!({ "scope": "project/payments", "key": "region", "value": "eu-west-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let first: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(first["version"], 1);

    let snapshot: serde_json::Value = client
        .get(format!("{}/context/snapshot", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let as_of = snapshot["asOf"].as_u64().unwrap();

    client
        .post(format!("{}/context", base_url))
        .json(&json!({
            "scope": "feature/payments/wf-9",
            "key": "region",
            "value": "us-east-1",
            "writerId": "planner"
        }))
        .send()
        .await
        .unwrap();

    let current: serde_json::Value = client
        .get(format!("{}/context", base_url))
        .query(&[("scope", "step/payments/wf-9/deploy"), ("key", "region")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["layer"]["value"], "us-east-1");

    let pinned: serde_json::Value = client
        .get(format!("{}/context", base_url))
        .query(&[
            ("scope", "step/payments/wf-9/deploy".to_string()),
            ("key", "region".to_string()),
            ("asOf", as_of.to_string()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pinned["layer"]["value"], "eu-west-1");

    let resp = client
        .get(format!("{}/context", base_url))
        .query(&[("scope", "nowhere/payments"), ("key", "region")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    println!("  PASS: most specific layer wins, asOf pins the read");

    println!("=== Test 2: Tool fallback ===");
    state
        .tools
        .register("lint", Arc::new(FlakyLinter { id: "lint-a", fail: true }))
        .await
        .unwrap();
    state
        .tools
        .register("lint", Arc::new(FlakyLinter { id: "lint-b", fail: false }))
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/tools/lint/invoke", base_url))
        .json(&json!({ "args": { "path": "src/lib.rs" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["by"], "lint-b");

    let body: serde_json::Value = client
        .get(format!("{}/tools", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["tools"].as_array().unwrap().len(), 2);

    let resp = client
        .post(format!("{}/tools/format/invoke", base_url))
        .json(&json!({ "args": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    println!("  PASS: failed adapter fell through to the next");

    state.shutdown().await;
}

#[tokio::test]
async fn test_event_stream_taps_the_bus() {
    let (state, base_url) = spawn_server(fast_config()).await;
    let client = reqwest::Client::new();

    println!("=== Test 1: SSE connect ===");
    let mut resp = client
        .get(format!("{}/events/stream", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let first = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&first).contains("event: connected"));
    println!("  PASS: connected");

    println!("=== Test 2: Published events are streamed ===");
    let resp2 = client
        .post(format!("{}/events", base_url))
        .json(&json!({ "type": "agent.heartbeat", "payload": { "agentId": "ghost" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp2.status(), 202);

    let mut seen = String::new();
    while !seen.contains("event: agent.heartbeat") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .expect("stream stalled")
            .unwrap()
            .expect("stream ended");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("\"agentId\":\"ghost\""));
    println!("  PASS: heartbeat streamed");

    state.shutdown().await;
}
