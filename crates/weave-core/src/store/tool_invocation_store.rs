use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::tool_invocation::{InvocationContext, InvocationStatus, ToolInvocation};

const INVOCATION_COLUMNS: &str = "id, requested_capability, chosen_adapter_id, attempt, status, \
     latency_ms, error, workflow_id, step_id, attempt_id, created_at";

#[derive(Clone)]
pub struct ToolInvocationStore {
    db: Database,
}

impl ToolInvocationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, invocation: &ToolInvocation) -> Result<(), ServerError> {
        let inv = invocation.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO tool_invocations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                         ON CONFLICT(id) DO UPDATE SET
                           status = excluded.status,
                           latency_ms = excluded.latency_ms,
                           error = excluded.error",
                        INVOCATION_COLUMNS
                    ),
                    rusqlite::params![
                        inv.id,
                        inv.requested_capability,
                        inv.chosen_adapter_id,
                        inv.attempt as i64,
                        inv.status.as_str(),
                        inv.latency_ms as i64,
                        inv.error,
                        inv.context.workflow_id,
                        inv.context.step_id,
                        inv.context.attempt_id,
                        inv.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Most recent invocations of a capability, newest first.
    pub async fn list_by_capability(
        &self,
        capability: &str,
        limit: usize,
    ) -> Result<Vec<ToolInvocation>, ServerError> {
        let cap = capability.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tool_invocations WHERE requested_capability = ?1 \
                     ORDER BY created_at DESC, attempt DESC LIMIT ?2",
                    INVOCATION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![cap, limit as i64], |row| {
                        Ok(row_to_invocation(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_step(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Vec<ToolInvocation>, ServerError> {
        let wf_id = workflow_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tool_invocations WHERE workflow_id = ?1 AND step_id = ?2 \
                     ORDER BY created_at ASC, attempt ASC",
                    INVOCATION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id, step_id], |row| {
                        Ok(row_to_invocation(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_invocation(row: &Row<'_>) -> ToolInvocation {
    let created_ms: i64 = row.get(10).unwrap_or(0);
    ToolInvocation {
        id: row.get(0).unwrap_or_default(),
        requested_capability: row.get(1).unwrap_or_default(),
        chosen_adapter_id: row.get(2).unwrap_or_default(),
        attempt: row.get::<_, i64>(3).unwrap_or(0) as u32,
        status: InvocationStatus::from_str(&row.get::<_, String>(4).unwrap_or_default())
            .unwrap_or(InvocationStatus::Pending),
        latency_ms: row.get::<_, i64>(5).unwrap_or(0) as u64,
        error: row.get(6).unwrap_or(None),
        context: InvocationContext {
            workflow_id: row.get(7).unwrap_or(None),
            step_id: row.get(8).unwrap_or(None),
            attempt_id: row.get(9).unwrap_or(None),
        },
        created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
    }
}
