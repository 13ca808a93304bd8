//! SQLite approval repository implementation.
//!
//! Responses and expiry are read-modify-write operations. Both run inside a
//! transaction on the single-connection writer pool, so two approvers
//! answering at the same time are applied one after the other and neither
//! vote is lost.

use agentflow_core::repository::{ApprovalRepository, RespondError};
use agentflow_types::approval::{ApprovalRequest, ApprovalResponse, ApprovalStatus, Approver};
use agentflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, parse_datetime, parse_enum, parse_optional_datetime, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `ApprovalRepository`.
pub struct SqliteApprovalRepository {
    pool: DatabasePool,
}

impl SqliteApprovalRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ApprovalRow {
    id: String,
    workflow_id: String,
    execution_id: String,
    step_id: String,
    run_id: String,
    title: String,
    message: String,
    context: String,
    approvers: String,
    required_approvals: i64,
    status: String,
    rejection_reason: Option<String>,
    responses: String,
    timeout_at: Option<String>,
    created_by: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            run_id: row.try_get("run_id")?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            context: row.try_get("context")?,
            approvers: row.try_get("approvers")?,
            required_approvals: row.try_get("required_approvals")?,
            status: row.try_get("status")?,
            rejection_reason: row.try_get("rejection_reason")?,
            responses: row.try_get("responses")?,
            timeout_at: row.try_get("timeout_at")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn into_request(self) -> Result<ApprovalRequest, RepositoryError> {
        Ok(ApprovalRequest {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            run_id: self.run_id,
            title: self.title,
            message: self.message,
            context: from_json(&self.context, "context")?,
            approvers: from_json(&self.approvers, "approvers")?,
            required_approvals: self.required_approvals.max(0) as u32,
            status: parse_enum(&self.status)?,
            rejection_reason: self.rejection_reason,
            responses: from_json(&self.responses, "responses")?,
            timeout_at: parse_optional_datetime(self.timeout_at.as_deref())?,
            created_by: self.created_by,
            created_at: parse_datetime(&self.created_at)?,
            resolved_at: parse_optional_datetime(self.resolved_at.as_deref())?,
        })
    }
}

fn rows_to_requests(rows: &[SqliteRow]) -> Result<Vec<ApprovalRequest>, RepositoryError> {
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ApprovalRow::from_row(row).map_err(query_error)?;
        requests.push(r.into_request()?);
    }
    Ok(requests)
}

async fn load_in_tx(
    conn: &mut SqliteConnection,
    id: &Uuid,
) -> Result<Option<ApprovalRequest>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    match row {
        Some(row) => {
            let r = ApprovalRow::from_row(&row).map_err(query_error)?;
            Ok(Some(r.into_request()?))
        }
        None => Ok(None),
    }
}

/// Write back the mutable part of a request: status, responses and
/// resolution.
async fn store_resolution(
    conn: &mut SqliteConnection,
    request: &ApprovalRequest,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "UPDATE approval_requests SET status = ?, rejection_reason = ?, responses = ?, resolved_at = ? WHERE id = ?",
    )
    .bind(request.status.to_string())
    .bind(&request.rejection_reason)
    .bind(to_json(&request.responses, "responses")?)
    .bind(request.resolved_at.as_ref().map(format_datetime))
    .bind(request.id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// ApprovalRepository impl
// ---------------------------------------------------------------------------

impl ApprovalRepository for SqliteApprovalRepository {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO approval_requests
               (id, workflow_id, execution_id, step_id, run_id, title, message, context,
                approvers, required_approvals, status, rejection_reason, responses,
                timeout_at, created_by, created_at, resolved_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(request.id.to_string())
        .bind(&request.workflow_id)
        .bind(request.execution_id.to_string())
        .bind(&request.step_id)
        .bind(&request.run_id)
        .bind(&request.title)
        .bind(&request.message)
        .bind(to_json(&request.context, "context")?)
        .bind(to_json(&request.approvers, "approvers")?)
        .bind(request.required_approvals as i64)
        .bind(request.status.to_string())
        .bind(&request.rejection_reason)
        .bind(to_json(&request.responses, "responses")?)
        .bind(request.timeout_at.as_ref().map(format_datetime))
        .bind(&request.created_by)
        .bind(format_datetime(&request.created_at))
        .bind(request.resolved_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("approval {} already exists", request.id)),
            ),
            Err(e) => Err(query_error(e)),
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ApprovalRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_request()?))
            }
            None => Ok(None),
        }
    }

    async fn respond(
        &self,
        id: &Uuid,
        response: ApprovalResponse,
    ) -> Result<ApprovalRequest, RespondError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut request = load_in_tx(&mut *tx, id).await?.ok_or(RespondError::NotFound)?;
        // Dropping `tx` on the error path rolls back.
        request.record_response(response)?;
        store_resolution(&mut *tx, &request).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(request)
    }

    async fn mark_expired(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let Some(mut request) = load_in_tx(&mut *tx, id).await? else {
            return Ok(None);
        };
        if !request.expire(now) {
            return Ok(None);
        }
        store_resolution(&mut *tx, &request).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(Some(request))
    }

    async fn list_pending_for_user(
        &self,
        who: &Approver,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        // Approver entries may be roles or wildcard patterns, so matching
        // happens after the status filter.
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(ApprovalStatus::Pending.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(rows_to_requests(&rows)?
            .into_iter()
            .filter(|r| r.is_listed_approver(who) && !r.has_responded(&who.user_id))
            .collect())
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE status = ? AND timeout_at IS NOT NULL AND timeout_at <= ? ORDER BY timeout_at ASC",
        )
        .bind(ApprovalStatus::Pending.to_string())
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_requests(&rows)
    }
}
