use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::agent::{AgentHealth, AgentRegistration, Capability};

/// Write-through persistence for agent registrations.
#[derive(Clone)]
pub struct AgentStore {
    db: Database,
}

impl AgentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, registration: &AgentRegistration) -> Result<(), ServerError> {
        let a = registration.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agent_registrations (agent_id, capabilities, health, last_heartbeat_at, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(agent_id) DO UPDATE SET
                       capabilities = excluded.capabilities,
                       health = excluded.health,
                       last_heartbeat_at = excluded.last_heartbeat_at,
                       registered_at = excluded.registered_at",
                    rusqlite::params![
                        a.agent_id,
                        serde_json::to_string(&a.capabilities).unwrap_or_else(|_| "[]".to_string()),
                        a.health.as_str(),
                        a.last_heartbeat_at.timestamp_millis(),
                        a.registered_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRegistration>, ServerError> {
        let id = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT agent_id, capabilities, health, last_heartbeat_at, registered_at
                     FROM agent_registrations WHERE agent_id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_registration(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<AgentRegistration>, ServerError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, capabilities, health, last_heartbeat_at, registered_at
                     FROM agent_registrations ORDER BY registered_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_registration(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_health(
        &self,
        agent_id: &str,
        health: AgentHealth,
    ) -> Result<(), ServerError> {
        let id = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE agent_registrations SET health = ?1 WHERE agent_id = ?2",
                    rusqlite::params![health.as_str(), id],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_registration(row: &Row<'_>) -> AgentRegistration {
    let capabilities: Vec<Capability> = row
        .get::<_, String>(1)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let heartbeat_ms: i64 = row.get(3).unwrap_or(0);
    let registered_ms: i64 = row.get(4).unwrap_or(0);

    AgentRegistration {
        agent_id: row.get(0).unwrap_or_default(),
        capabilities,
        health: AgentHealth::from_str(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(AgentHealth::Unreachable),
        last_heartbeat_at: DateTime::from_timestamp_millis(heartbeat_ms).unwrap_or_else(Utc::now),
        registered_at: DateTime::from_timestamp_millis(registered_ms).unwrap_or_else(Utc::now),
        in_flight: 0,
    }
}
