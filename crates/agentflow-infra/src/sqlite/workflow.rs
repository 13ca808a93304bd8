//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `agentflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs next to their
//! metadata columns. Executions keep step results and the approval
//! checkpoint as JSON so a suspended run can be restored after a restart.

use agentflow_core::repository::WorkflowRepository;
use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{Execution, ExecutionCheckpoint, ExecutionStatus, StepExecutionResult};
use agentflow_types::workflow::{
    DefinitionMetadata, DefinitionStatus, StoredWorkflow, WorkflowDefinition,
};
use chrono::Utc;
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, parse_datetime, parse_enum, parse_optional_datetime, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    owner: Option<String>,
    status: String,
    definition: String,
    created_at: String,
    updated_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            owner: row.try_get("owner")?,
            status: row.try_get("status")?,
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_stored(self) -> Result<StoredWorkflow, RepositoryError> {
        let definition: WorkflowDefinition = from_json(&self.definition, "definition")?;
        Ok(StoredWorkflow {
            definition,
            metadata: DefinitionMetadata {
                owner: self.owner,
                status: parse_enum::<DefinitionStatus>(&self.status)?,
            },
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    run_id: String,
    status: String,
    user_id: Option<String>,
    input: String,
    output: Option<String>,
    error: Option<String>,
    steps_executed: String,
    step_results: String,
    checkpoint: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            run_id: row.try_get("run_id")?,
            status: row.try_get("status")?,
            user_id: row.try_get("user_id")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            steps_executed: row.try_get("steps_executed")?,
            step_results: row.try_get("step_results")?,
            checkpoint: row.try_get("checkpoint")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let steps_executed: Vec<String> = from_json(&self.steps_executed, "steps_executed")?;
        let step_results: HashMap<String, StepExecutionResult> =
            from_json(&self.step_results, "step_results")?;
        let checkpoint: Option<ExecutionCheckpoint> = self
            .checkpoint
            .as_deref()
            .map(|c| from_json(c, "checkpoint"))
            .transpose()?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            run_id: self.run_id,
            status: parse_enum(&self.status)?,
            user_id: self.user_id,
            input: self.input,
            output: self.output,
            error: self.error,
            steps_executed,
            step_results,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            checkpoint,
        })
    }
}

/// JSON-encoded columns of an execution, computed once per write.
struct ExecutionColumns {
    steps_executed: String,
    step_results: String,
    checkpoint: Option<String>,
}

impl ExecutionColumns {
    fn encode(execution: &Execution) -> Result<Self, RepositoryError> {
        Ok(Self {
            steps_executed: to_json(&execution.steps_executed, "steps_executed")?,
            step_results: to_json(&execution.step_results, "step_results")?,
            checkpoint: execution
                .checkpoint
                .as_ref()
                .map(|c| to_json(c, "checkpoint"))
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(
        &self,
        def: &WorkflowDefinition,
        metadata: &DefinitionMetadata,
    ) -> Result<StoredWorkflow, RepositoryError> {
        let definition_json = to_json(def, "definition")?;
        let now = Utc::now();
        let now_str = format_datetime(&now);

        let row = sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, owner, status, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 owner = excluded.owner,
                 status = excluded.status,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at
               RETURNING created_at"#,
        )
        .bind(&def.id)
        .bind(def.display_name())
        .bind(&metadata.owner)
        .bind(metadata.status.to_string())
        .bind(&definition_json)
        .bind(&now_str)
        .bind(&now_str)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let created_at: String = row.try_get("created_at").map_err(query_error)?;

        Ok(StoredWorkflow {
            definition: def.clone(),
            metadata: metadata.clone(),
            created_at: parse_datetime(&created_at)?,
            updated_at: now,
        })
    }

    async fn get_definition(&self, id: &str) -> Result<Option<StoredWorkflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_stored()?))
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM workflow_definitions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_error)?;
        Ok(row.is_some())
    }

    async fn list_definitions(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<StoredWorkflow>, RepositoryError> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query("SELECT * FROM workflow_definitions WHERE owner = ? ORDER BY id ASC")
                    .bind(owner)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_definitions ORDER BY id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row).map_err(query_error)?;
            defs.push(r.into_stored()?);
        }
        Ok(defs)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let cols = ExecutionColumns::encode(execution)?;

        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, run_id, status, user_id, input, output, error,
                steps_executed, step_results, checkpoint, started_at, completed_at, duration_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.run_id)
        .bind(execution.status.to_string())
        .bind(&execution.user_id)
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(&cols.steps_executed)
        .bind(&cols.step_results)
        .bind(&cols.checkpoint)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_ms.map(|d| d as i64))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("execution {} already exists", execution.id)),
            ),
            Err(e) => Err(query_error(e)),
        }
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let cols = ExecutionColumns::encode(execution)?;

        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?, output = ?, error = ?, steps_executed = ?, step_results = ?,
                 checkpoint = ?, completed_at = ?, duration_ms = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.to_string())
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(&cols.steps_executed)
        .bind(&cols.step_results)
        .bind(&cols.checkpoint)
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_ms.map(|d| d as i64))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn list_waiting_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = ? ORDER BY started_at")
            .bind(ExecutionStatus::WaitingForApproval.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }
}
