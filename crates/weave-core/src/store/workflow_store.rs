use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::agent::Capability;
use crate::models::definition::WorkflowDefinition;
use crate::models::step::{ReasonCode, Step, StepStatus};
use crate::models::workflow::{RetryPolicy, Workflow, WorkflowStatus};

const WORKFLOW_COLUMNS: &str = "id, name, description, project_id, tenant_id, status, retry_policy, \
     definition, failure, created_at, started_at, completed_at, updated_at";

const STEP_COLUMNS: &str = "workflow_id, id, idx, step_type, config, depends_on, required, \
     continue_on_failure, fallback_for, tools, max_attempts, timeout_ms, status, attempt, \
     current_attempt_id, assigned_agent_id, result, error, skip_reason, next_retry_at, \
     dispatch_waits, updated_at";

/// Persists workflows together with their step rows.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new workflow and all of its steps atomically.
    pub async fn create(&self, workflow: &Workflow, steps: &[Step]) -> Result<(), ServerError> {
        self.save_run(workflow, steps).await
    }

    /// Upsert the workflow row and the given steps in one transaction.
    pub async fn save_run(&self, workflow: &Workflow, steps: &[Step]) -> Result<(), ServerError> {
        let wf = workflow.clone();
        let steps = steps.to_vec();
        self.db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction()?;
                upsert_workflow(&tx, &wf)?;
                for step in &steps {
                    upsert_step(&tx, step)?;
                }
                tx.commit()
            })
            .await
    }

    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), ServerError> {
        let wf = workflow.clone();
        self.db
            .with_conn_async(move |conn| upsert_workflow(conn, &wf))
            .await
    }

    pub async fn save_steps(&self, steps: &[Step]) -> Result<(), ServerError> {
        let steps = steps.to_vec();
        self.db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction()?;
                for step in &steps {
                    upsert_step(&tx, step)?;
                }
                tx.commit()
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    /// List workflows, newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, ServerError> {
        let status_str = status.map(|s| s.as_str().to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflows WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status_str], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Workflows a restarted engine must resume.
    pub async fn list_active(&self) -> Result<Vec<Workflow>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflows WHERE status IN ('running', 'waiting') ORDER BY created_at ASC",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Cancelled workflows whose supervisor died before closing them out.
    pub async fn list_unfinalized_cancelled(&self) -> Result<Vec<Workflow>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflows WHERE status = 'cancelled' AND completed_at IS NULL",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_steps(&self, workflow_id: &str) -> Result<Vec<Step>, ServerError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM steps WHERE workflow_id = ?1 ORDER BY idx ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn upsert_workflow(conn: &Connection, wf: &Workflow) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO workflows ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               failure = excluded.failure,
               started_at = excluded.started_at,
               completed_at = excluded.completed_at,
               updated_at = excluded.updated_at",
            WORKFLOW_COLUMNS
        ),
        rusqlite::params![
            wf.id,
            wf.name,
            wf.description,
            wf.project_id,
            wf.tenant_id,
            wf.status.as_str(),
            serde_json::to_string(&wf.retry).unwrap_or_default(),
            serde_json::to_string(&wf.definition).unwrap_or_default(),
            wf.failure
                .as_ref()
                .and_then(|f| serde_json::to_string(f).ok()),
            wf.created_at.timestamp_millis(),
            wf.started_at.map(|t| t.timestamp_millis()),
            wf.completed_at.map(|t| t.timestamp_millis()),
            wf.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn upsert_step(conn: &Connection, s: &Step) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO steps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(workflow_id, id) DO UPDATE SET
               status = excluded.status,
               attempt = excluded.attempt,
               current_attempt_id = excluded.current_attempt_id,
               assigned_agent_id = excluded.assigned_agent_id,
               result = excluded.result,
               error = excluded.error,
               skip_reason = excluded.skip_reason,
               next_retry_at = excluded.next_retry_at,
               dispatch_waits = excluded.dispatch_waits,
               updated_at = excluded.updated_at",
            STEP_COLUMNS
        ),
        rusqlite::params![
            s.workflow_id,
            s.id,
            s.index as i64,
            s.step_type.as_str(),
            serde_json::to_string(&s.config).unwrap_or_else(|_| "null".to_string()),
            serde_json::to_string(&s.depends_on).unwrap_or_else(|_| "[]".to_string()),
            s.required as i64,
            s.continue_on_failure as i64,
            s.fallback_for,
            serde_json::to_string(&s.tools).unwrap_or_else(|_| "[]".to_string()),
            s.max_attempts.map(|v| v as i64),
            s.timeout_ms.map(|v| v as i64),
            s.status.as_str(),
            s.attempt as i64,
            s.current_attempt_id,
            s.assigned_agent_id,
            s.result.as_ref().and_then(|v| serde_json::to_string(v).ok()),
            s.error.as_ref().and_then(|e| serde_json::to_string(e).ok()),
            s.skip_reason.map(|r| r.as_str()),
            s.next_retry_at.map(|t| t.timestamp_millis()),
            s.dispatch_waits as i64,
            s.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn row_to_workflow(row: &Row<'_>) -> Workflow {
    let retry: RetryPolicy = row
        .get::<_, String>(6)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let definition = row
        .get::<_, String>(7)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| WorkflowDefinition::new("", Vec::new()));
    let failure = row
        .get::<_, Option<String>>(8)
        .unwrap_or(None)
        .and_then(|s| serde_json::from_str(&s).ok());

    Workflow {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or(None),
        project_id: row.get(3).unwrap_or_default(),
        tenant_id: row.get(4).unwrap_or(None),
        status: WorkflowStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(WorkflowStatus::Draft),
        retry,
        definition,
        failure,
        created_at: millis(row.get(9).unwrap_or(0)),
        started_at: row.get::<_, Option<i64>>(10).unwrap_or(None).map(millis),
        completed_at: row.get::<_, Option<i64>>(11).unwrap_or(None).map(millis),
        updated_at: millis(row.get(12).unwrap_or(0)),
    }
}

fn row_to_step(row: &Row<'_>) -> Step {
    let json_list = |idx: usize| -> Vec<String> {
        row.get::<_, String>(idx)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    };

    Step {
        workflow_id: row.get(0).unwrap_or_default(),
        id: row.get(1).unwrap_or_default(),
        index: row.get::<_, i64>(2).unwrap_or(0) as usize,
        step_type: Capability::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(Capability::Build),
        config: row
            .get::<_, String>(4)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        depends_on: json_list(5),
        required: row.get::<_, i64>(6).unwrap_or(1) != 0,
        continue_on_failure: row.get::<_, i64>(7).unwrap_or(0) != 0,
        fallback_for: row.get(8).unwrap_or(None),
        tools: json_list(9),
        max_attempts: row.get::<_, Option<i64>>(10).unwrap_or(None).map(|v| v as u32),
        timeout_ms: row.get::<_, Option<i64>>(11).unwrap_or(None).map(|v| v as u64),
        status: StepStatus::from_str(&row.get::<_, String>(12).unwrap_or_default())
            .unwrap_or(StepStatus::Pending),
        attempt: row.get::<_, i64>(13).unwrap_or(0) as u32,
        current_attempt_id: row.get(14).unwrap_or(None),
        assigned_agent_id: row.get(15).unwrap_or(None),
        result: row
            .get::<_, Option<String>>(16)
            .unwrap_or(None)
            .and_then(|s| serde_json::from_str(&s).ok()),
        error: row
            .get::<_, Option<String>>(17)
            .unwrap_or(None)
            .and_then(|s| serde_json::from_str(&s).ok()),
        skip_reason: row
            .get::<_, Option<String>>(18)
            .unwrap_or(None)
            .and_then(|s| ReasonCode::from_str(&s)),
        next_retry_at: row.get::<_, Option<i64>>(19).unwrap_or(None).map(millis),
        dispatch_waits: row.get::<_, i64>(20).unwrap_or(0) as u32,
        updated_at: millis(row.get(21).unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::definition::StepDefinition;
    use crate::models::step::StepError;

    fn sample() -> (Workflow, Vec<Step>) {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "design", &[]),
                StepDefinition::new("b", "build", &["a"]),
            ],
        );
        let wf = Workflow::new("wf-1".into(), def.clone(), &RetryPolicy::default());
        let steps = def
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Step::from_definition(&wf.id, i, s, Capability::from_str(&s.step_type).unwrap())
            })
            .collect();
        (wf, steps)
    }

    #[tokio::test]
    async fn create_then_update_round_trips_runtime_fields() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let (mut wf, mut steps) = sample();
        store.create(&wf, &steps).await.unwrap();

        wf.status = WorkflowStatus::Running;
        wf.started_at = Some(Utc::now());
        steps[1].status = StepStatus::Failed;
        steps[1].attempt = 2;
        steps[1].error = Some(StepError::new(ReasonCode::Timeout, "slow"));
        steps[1].next_retry_at = Some(Utc::now());
        store.save_run(&wf, &steps).await.unwrap();

        let loaded = store.get("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(loaded.definition.steps.len(), 2);
        assert!(loaded.started_at.is_some());

        let loaded_steps = store.list_steps("wf-1").await.unwrap();
        assert_eq!(loaded_steps[0].id, "a");
        assert_eq!(loaded_steps[1].depends_on, vec!["a"]);
        assert_eq!(loaded_steps[1].attempt, 2);
        assert_eq!(loaded_steps[1].error.as_ref().unwrap().code, ReasonCode::Timeout);
        assert!(loaded_steps[1].awaiting_retry());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let (mut wf, steps) = sample();
        store.create(&wf, &steps).await.unwrap();
        assert_eq!(store.list(Some(WorkflowStatus::Draft)).await.unwrap().len(), 1);
        assert!(store.list_active().await.unwrap().is_empty());

        wf.status = WorkflowStatus::Waiting;
        store.save_workflow(&wf).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);
        assert!(store.list(Some(WorkflowStatus::Draft)).await.unwrap().is_empty());
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }
}
