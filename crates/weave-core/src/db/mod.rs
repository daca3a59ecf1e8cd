//! SQLite persistence layer for the orchestration core.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ServerError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Like `with_conn`, but hands out a mutable connection so the closure
    /// can open a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&mut conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Transactional variant of `with_conn_async`.
    pub async fn with_conn_mut_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn_mut(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT,
                    project_id      TEXT NOT NULL,
                    tenant_id       TEXT,
                    status          TEXT NOT NULL DEFAULT 'draft',
                    retry_policy    TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    failure         TEXT,
                    created_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);

                CREATE TABLE IF NOT EXISTS steps (
                    workflow_id         TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    id                  TEXT NOT NULL,
                    idx                 INTEGER NOT NULL,
                    step_type           TEXT NOT NULL,
                    config              TEXT NOT NULL DEFAULT 'null',
                    depends_on          TEXT NOT NULL DEFAULT '[]',
                    required            INTEGER NOT NULL DEFAULT 1,
                    continue_on_failure INTEGER NOT NULL DEFAULT 0,
                    fallback_for        TEXT,
                    tools               TEXT NOT NULL DEFAULT '[]',
                    max_attempts        INTEGER,
                    timeout_ms          INTEGER,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    attempt             INTEGER NOT NULL DEFAULT 0,
                    current_attempt_id  TEXT,
                    assigned_agent_id   TEXT,
                    result              TEXT,
                    error               TEXT,
                    skip_reason         TEXT,
                    next_retry_at       INTEGER,
                    dispatch_waits      INTEGER NOT NULL DEFAULT 0,
                    updated_at          INTEGER NOT NULL,
                    PRIMARY KEY (workflow_id, id)
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id        TEXT NOT NULL UNIQUE,
                    topic           TEXT NOT NULL,
                    event_type      TEXT NOT NULL,
                    workflow_id     TEXT,
                    step_id         TEXT,
                    attempt_id      TEXT,
                    causation_id    TEXT,
                    correlation_id  TEXT,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    schema_version  INTEGER NOT NULL,
                    produced_at     INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_workflow ON events(workflow_id, produced_at);

                CREATE TABLE IF NOT EXISTS context_layers (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    scope           TEXT NOT NULL,
                    key             TEXT NOT NULL,
                    version         INTEGER NOT NULL,
                    value           TEXT NOT NULL,
                    writer_id       TEXT NOT NULL,
                    written_at      INTEGER NOT NULL,
                    UNIQUE (scope, key, version)
                );

                CREATE TABLE IF NOT EXISTS tool_invocations (
                    id                      TEXT PRIMARY KEY,
                    requested_capability    TEXT NOT NULL,
                    chosen_adapter_id       TEXT NOT NULL,
                    attempt                 INTEGER NOT NULL,
                    status                  TEXT NOT NULL,
                    latency_ms              INTEGER NOT NULL DEFAULT 0,
                    error                   TEXT,
                    workflow_id             TEXT,
                    step_id                 TEXT,
                    attempt_id              TEXT,
                    created_at              INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tool_invocations_capability ON tool_invocations(requested_capability, created_at);
                CREATE INDEX IF NOT EXISTS idx_tool_invocations_step ON tool_invocations(workflow_id, step_id);

                CREATE TABLE IF NOT EXISTS agent_registrations (
                    agent_id            TEXT PRIMARY KEY,
                    capabilities        TEXT NOT NULL DEFAULT '[]',
                    health              TEXT NOT NULL DEFAULT 'healthy',
                    last_heartbeat_at   INTEGER NOT NULL,
                    registered_at       INTEGER NOT NULL
                );
                ",
            )
        })
    }
}
