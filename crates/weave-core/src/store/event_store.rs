use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::event::{Event, EventType};

/// Append-only journal behind the message bus.
#[derive(Clone)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event. Returns `false` when the event id was already
    /// journaled; the first copy is kept.
    pub async fn append(&self, topic: &str, event: &Event) -> Result<bool, ServerError> {
        let topic = topic.to_string();
        let e = event.clone();
        self.db
            .with_conn_async(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO events (event_id, topic, event_type, workflow_id, step_id, \
                     attempt_id, causation_id, correlation_id, payload, schema_version, produced_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        e.event_id,
                        topic,
                        e.event_type.as_str(),
                        e.workflow_id,
                        e.step_id,
                        e.attempt_id,
                        e.causation_id,
                        e.correlation_id,
                        serde_json::to_string(&e.payload).unwrap_or_else(|_| "{}".to_string()),
                        e.schema_version as i64,
                        e.produced_at.timestamp_millis(),
                    ],
                )?;
                Ok(inserted > 0)
            })
            .await
    }

    /// Every journaled event of a workflow in production order.
    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<Event>, ServerError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_id, event_type, workflow_id, step_id, attempt_id, causation_id, \
                     correlation_id, payload, schema_version, produced_at \
                     FROM events WHERE workflow_id = ?1 ORDER BY produced_at ASC, seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id], |row| Ok(row_to_event(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().flatten().collect())
            })
            .await
    }

    pub async fn count(&self) -> Result<u64, ServerError> {
        self.db
            .with_conn_async(|conn| {
                conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
            })
            .await
    }
}

fn row_to_event(row: &Row<'_>) -> Option<Event> {
    let event_type = EventType::from_str(&row.get::<_, String>(1).unwrap_or_default())?;
    let produced_ms: i64 = row.get(9).unwrap_or(0);
    Some(Event {
        event_id: row.get(0).unwrap_or_default(),
        event_type,
        workflow_id: row.get(2).unwrap_or(None),
        step_id: row.get(3).unwrap_or(None),
        attempt_id: row.get(4).unwrap_or(None),
        causation_id: row.get(5).unwrap_or(None),
        correlation_id: row.get(6).unwrap_or(None),
        payload: row
            .get::<_, String>(7)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        schema_version: row.get::<_, i64>(8).unwrap_or(1) as u32,
        produced_at: DateTime::from_timestamp_millis(produced_ms).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_keeps_first_copy_of_an_event_id() {
        let store = EventStore::new(Database::open_in_memory().unwrap());
        let event = Event::new(EventType::StepCompleted, json!({"result": 1})).for_workflow("wf");
        assert!(store.append("step.completed", &event).await.unwrap());

        let mut dup = event.clone();
        dup.payload = json!({"result": 2});
        assert!(!store.append("step.completed", &dup).await.unwrap());

        let events = store.list_by_workflow("wf").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["result"], 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_orders_same_millisecond_events_by_insertion() {
        let store = EventStore::new(Database::open_in_memory().unwrap());
        let produced_at = Utc::now();
        for ty in [EventType::WorkflowStarted, EventType::StepDispatch, EventType::StepStarted] {
            let mut e = Event::new(ty, json!({})).for_workflow("wf");
            e.produced_at = produced_at;
            store.append(ty.topic(), &e).await.unwrap();
        }
        let types: Vec<EventType> = store
            .list_by_workflow("wf")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![EventType::WorkflowStarted, EventType::StepDispatch, EventType::StepStarted]
        );
    }
}
