use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::context::ContextLayer;

const LAYER_COLUMNS: &str = "seq, scope, key, version, value, writer_id, written_at";

/// Append-only storage of versioned context layers.
#[derive(Clone)]
pub struct ContextStore {
    db: Database,
}

impl ContextStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append the next version of `(scope, key)`. Version allocation and the
    /// insert share one immediate transaction so concurrent writers never
    /// collide.
    pub async fn append(
        &self,
        scope: &str,
        key: &str,
        value: &serde_json::Value,
        writer_id: &str,
    ) -> Result<ContextLayer, ServerError> {
        let scope = scope.to_string();
        let key = key.to_string();
        let value = value.clone();
        let writer_id = writer_id.to_string();
        self.db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let version: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM context_layers WHERE scope = ?1 AND key = ?2",
                    rusqlite::params![scope, key],
                    |row| row.get(0),
                )?;
                let written_at = Utc::now();
                tx.execute(
                    "INSERT INTO context_layers (scope, key, version, value, writer_id, written_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        scope,
                        key,
                        version,
                        serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string()),
                        writer_id,
                        written_at.timestamp_millis(),
                    ],
                )?;
                let seq = tx.last_insert_rowid();
                tx.commit()?;
                Ok(ContextLayer {
                    scope,
                    key,
                    value,
                    version: version as u64,
                    seq: seq as u64,
                    writer_id,
                    written_at,
                })
            })
            .await
    }

    /// Highest version of `(scope, key)` committed at or before `as_of`.
    pub async fn latest(
        &self,
        scope: &str,
        key: &str,
        as_of: Option<u64>,
    ) -> Result<Option<ContextLayer>, ServerError> {
        let scope = scope.to_string();
        let key = key.to_string();
        let as_of = as_of.map_or(i64::MAX, |s| i64::try_from(s).unwrap_or(i64::MAX));
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM context_layers WHERE scope = ?1 AND key = ?2 AND seq <= ?3 \
                         ORDER BY version DESC LIMIT 1",
                        LAYER_COLUMNS
                    ),
                    rusqlite::params![scope, key, as_of],
                    |row| Ok(row_to_layer(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn version(
        &self,
        scope: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<ContextLayer>, ServerError> {
        let scope = scope.to_string();
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM context_layers WHERE scope = ?1 AND key = ?2 AND version = ?3",
                        LAYER_COLUMNS
                    ),
                    rusqlite::params![scope, key, version as i64],
                    |row| Ok(row_to_layer(row)),
                )
                .optional()
            })
            .await
    }

    /// Full version history of one key, oldest first.
    pub async fn history(&self, scope: &str, key: &str) -> Result<Vec<ContextLayer>, ServerError> {
        let scope = scope.to_string();
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM context_layers WHERE scope = ?1 AND key = ?2 ORDER BY version ASC",
                    LAYER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![scope, key], |row| Ok(row_to_layer(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Latest layer of every key within one scope.
    pub async fn list_latest(&self, scope: &str) -> Result<Vec<ContextLayer>, ServerError> {
        let scope = scope.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM context_layers c WHERE scope = ?1 AND version = \
                     (SELECT MAX(version) FROM context_layers WHERE scope = c.scope AND key = c.key) \
                     ORDER BY key ASC",
                    LAYER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![scope], |row| Ok(row_to_layer(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Sequence number of the most recent commit, 0 when empty.
    pub async fn max_seq(&self) -> Result<u64, ServerError> {
        self.db
            .with_conn_async(|conn| {
                conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM context_layers", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
            })
            .await
    }
}

fn row_to_layer(row: &Row<'_>) -> ContextLayer {
    let written_ms: i64 = row.get(6).unwrap_or(0);
    ContextLayer {
        seq: row.get::<_, i64>(0).unwrap_or(0) as u64,
        scope: row.get(1).unwrap_or_default(),
        key: row.get(2).unwrap_or_default(),
        version: row.get::<_, i64>(3).unwrap_or(0) as u64,
        value: row
            .get::<_, String>(4)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        writer_id: row.get(5).unwrap_or_default(),
        written_at: DateTime::from_timestamp_millis(written_ms).unwrap_or_else(Utc::now),
    }
}
