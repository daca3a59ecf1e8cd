use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt as _;

use crate::error::ServerError;
use crate::models::{Event, EventType};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(publish_event))
        .route("/stream", get(event_stream))
}

/// Event types external agents may publish over HTTP. Everything else on the
/// bus is produced by the engine itself. Cancellation goes through
/// `POST /workflows/{id}/cancel` so drafts are finalized the same way.
fn accepts_from_agents(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::StepStarted
            | EventType::StepCompleted
            | EventType::StepFailed
            | EventType::AgentRegister
            | EventType::AgentHeartbeat
            | EventType::AgentDeregister
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishEventRequest {
    /// Idempotency key. Re-sending the same id is harmless.
    event_id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    workflow_id: Option<String>,
    step_id: Option<String>,
    attempt_id: Option<String>,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl PublishEventRequest {
    fn into_event(self) -> Result<Event, ServerError> {
        let event_type = EventType::from_str(&self.event_type).ok_or_else(|| {
            ServerError::BadRequest(format!("Unknown event type: {}", self.event_type))
        })?;
        if event_type == EventType::WorkflowCancel {
            return Err(ServerError::BadRequest(
                "workflow.cancel is requested with POST /workflows/{id}/cancel".to_string(),
            ));
        }
        if !accepts_from_agents(event_type) {
            return Err(ServerError::BadRequest(format!(
                "{} events are produced by the engine",
                event_type
            )));
        }

        let is_step_event = matches!(
            event_type,
            EventType::StepStarted | EventType::StepCompleted | EventType::StepFailed
        );
        if is_step_event
            && (self.workflow_id.is_none() || self.step_id.is_none() || self.attempt_id.is_none())
        {
            return Err(ServerError::BadRequest(format!(
                "{} requires workflowId, stepId and attemptId",
                event_type
            )));
        }

        let mut event = Event::new(event_type, self.payload);
        if let Some(id) = self.event_id {
            event.event_id = id;
        }
        event.workflow_id = self.workflow_id;
        event.step_id = self.step_id;
        event.attempt_id = self.attempt_id;
        event.causation_id = self.causation_id;
        event.correlation_id = self.correlation_id.or_else(|| event.workflow_id.clone());
        Ok(event)
    }
}

async fn publish_event(
    State(state): State<AppState>,
    Json(body): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    let event = body.into_event()?;
    state.bus.emit(&event).await?;
    tracing::debug!(
        "[Events] Accepted {} {} over HTTP",
        event.event_type,
        event.event_id
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "eventId": event.event_id })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventStreamQuery {
    workflow_id: Option<String>,
}

type SseStream =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<SseEvent, Infallible>> + Send>>;

/// `GET /events/stream?workflowId=xxx`: SSE tap of everything published on
/// the bus, optionally narrowed to one workflow.
async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<SseStream> {
    let mut rx = state.bus.tap();
    let filter = query.workflow_id;

    let initial = tokio_stream::once(Ok::<_, Infallible>(
        SseEvent::default()
            .event("connected")
            .data(serde_json::json!({ "workflowId": filter }).to_string()),
    ));

    let heartbeat = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_secs(15),
    ))
    .map(|_| Ok(SseEvent::default().comment("heartbeat")));

    let events = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(wanted) = &filter {
                        if event.workflow_id.as_deref() != Some(wanted.as_str()) {
                            continue;
                        }
                    }
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::error!("[Events] Failed to encode {}: {}", event.event_id, e);
                            continue;
                        }
                    };
                    yield Ok::<_, Infallible>(
                        SseEvent::default()
                            .id(event.event_id.clone())
                            .event(event.event_type.as_str())
                            .data(data),
                    );
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("[Events] SSE client lagged, {} events dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    let stream: SseStream = Box::pin(initial.chain(tokio_stream::StreamExt::merge(events, heartbeat)));
    Sse::new(stream)
}
