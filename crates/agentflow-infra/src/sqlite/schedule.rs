//! SQLite schedule repository implementation.

use agentflow_core::repository::ScheduleRepository;
use agentflow_types::error::RepositoryError;
use agentflow_types::schedule::{ScheduleRecord, ScheduleRun, SyncState};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, parse_datetime, parse_enum, parse_optional_datetime, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `ScheduleRepository`.
pub struct SqliteScheduleRepository {
    pool: DatabasePool,
}

impl SqliteScheduleRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ScheduleRow {
    id: String,
    workflow_id: String,
    owner: String,
    cron_expression: String,
    timezone: String,
    enabled: bool,
    input: String,
    context: String,
    durable_id: Option<String>,
    sync_state: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    run_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            owner: row.try_get("owner")?,
            cron_expression: row.try_get("cron_expression")?,
            timezone: row.try_get("timezone")?,
            enabled: row.try_get("enabled")?,
            input: row.try_get("input")?,
            context: row.try_get("context")?,
            durable_id: row.try_get("durable_id")?,
            sync_state: row.try_get("sync_state")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            run_count: row.try_get("run_count")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<ScheduleRecord, RepositoryError> {
        Ok(ScheduleRecord {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            owner: self.owner,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            enabled: self.enabled,
            input: self.input,
            context: from_json(&self.context, "context")?,
            durable_id: self.durable_id,
            sync_state: parse_enum::<SyncState>(&self.sync_state)?,
            next_run_at: parse_optional_datetime(self.next_run_at.as_deref())?,
            last_run_at: parse_optional_datetime(self.last_run_at.as_deref())?,
            run_count: self.run_count.max(0) as u64,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn rows_to_records(rows: &[SqliteRow]) -> Result<Vec<ScheduleRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ScheduleRow::from_row(row).map_err(query_error)?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// ScheduleRepository impl
// ---------------------------------------------------------------------------

impl ScheduleRepository for SqliteScheduleRepository {
    async fn create(&self, record: &ScheduleRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO schedules
               (id, workflow_id, owner, cron_expression, timezone, enabled, input, context,
                durable_id, sync_state, next_run_at, last_run_at, run_count, last_error,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.owner)
        .bind(&record.cron_expression)
        .bind(&record.timezone)
        .bind(record.enabled)
        .bind(&record.input)
        .bind(to_json(&record.context, "context")?)
        .bind(&record.durable_id)
        .bind(record.sync_state.to_string())
        .bind(record.next_run_at.as_ref().map(format_datetime))
        .bind(record.last_run_at.as_ref().map(format_datetime))
        .bind(record.run_count as i64)
        .bind(&record.last_error)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("schedule {} already exists", record.id)),
            ),
            Err(e) => Err(query_error(e)),
        }
    }

    async fn update(&self, record: &ScheduleRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE schedules SET
                 workflow_id = ?, owner = ?, cron_expression = ?, timezone = ?, enabled = ?,
                 input = ?, context = ?, durable_id = ?, sync_state = ?, next_run_at = ?,
                 last_run_at = ?, run_count = ?, last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&record.workflow_id)
        .bind(&record.owner)
        .bind(&record.cron_expression)
        .bind(&record.timezone)
        .bind(record.enabled)
        .bind(&record.input)
        .bind(to_json(&record.context, "context")?)
        .bind(&record.durable_id)
        .bind(record.sync_state.to_string())
        .bind(record.next_run_at.as_ref().map(format_datetime))
        .bind(record.last_run_at.as_ref().map(format_datetime))
        .bind(record.run_count as i64)
        .bind(&record.last_error)
        .bind(format_datetime(&record.updated_at))
        .bind(record.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ScheduleRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ScheduleRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn get_by_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE workflow_id = ? ORDER BY created_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_records(&rows)
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query("SELECT * FROM schedules WHERE owner = ? ORDER BY created_at ASC")
                    .bind(owner)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM schedules ORDER BY created_at ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        rows_to_records(&rows)
    }

    async fn record_run(&self, id: &Uuid, run: &ScheduleRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE schedules SET
                 last_run_at = ?, run_count = run_count + 1, last_error = ?,
                 next_run_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(format_datetime(&run.fired_at))
        .bind(&run.error)
        .bind(run.next_run_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_pending_sync(&self) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE sync_state = ? ORDER BY updated_at ASC",
        )
        .bind(SyncState::PendingSync.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_records(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use serde_json::{Map, Value};

    use crate::sqlite::pool::database_url;

    async fn test_repo() -> (SqliteScheduleRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        (SqliteScheduleRepository::new(pool), dir)
    }

    fn record(workflow_id: &str, owner: &str, created_at: DateTime<Utc>) -> ScheduleRecord {
        let mut context = Map::new();
        context.insert("region".into(), Value::String("eu".into()));
        ScheduleRecord {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            owner: owner.into(),
            cron_expression: "0 9 * * 1-5".into(),
            timezone: "Europe/Berlin".into(),
            enabled: true,
            input: "daily".into(),
            context,
            durable_id: None,
            sync_state: SyncState::PendingSync,
            next_run_at: Some(created_at + Duration::hours(1)),
            last_run_at: None,
            run_count: 0,
            last_error: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (repo, _dir) = test_repo().await;
        let rec = record("report", "u1", Utc::now());
        repo.create(&rec).await.unwrap();

        let loaded = repo.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.cron_expression, "0 9 * * 1-5");
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert!(loaded.enabled);
        assert_eq!(loaded.context["region"], "eu");
        assert_eq!(loaded.sync_state, SyncState::PendingSync);
        assert_eq!(
            loaded.next_run_at.map(|t| t.timestamp()),
            rec.next_run_at.map(|t| t.timestamp())
        );
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_replaces_row() {
        let (repo, _dir) = test_repo().await;
        let mut rec = record("report", "u1", Utc::now());
        repo.create(&rec).await.unwrap();

        rec.enabled = false;
        rec.durable_id = Some("sched-1".into());
        rec.sync_state = SyncState::Synced;
        rec.last_error = Some("previous push failed".into());
        repo.update(&rec).await.unwrap();

        let loaded = repo.get(&rec.id).await.unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.durable_id.as_deref(), Some("sched-1"));
        assert_eq!(loaded.sync_state, SyncState::Synced);
        assert_eq!(loaded.last_error.as_deref(), Some("previous push failed"));
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let (repo, _dir) = test_repo().await;
        let err = repo.update(&record("report", "u1", Utc::now())).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound), "got: {err}");
    }

    #[tokio::test]
    async fn test_list_and_filters() {
        let (repo, _dir) = test_repo().await;
        let base = Utc::now();
        let first = record("report", "u1", base);
        let second = record("digest", "u2", base + Duration::seconds(1));
        let third = record("report", "u1", base + Duration::seconds(2));
        for r in [&first, &second, &third] {
            repo.create(r).await.unwrap();
        }

        let all: Vec<Uuid> = repo.list(None).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(all, vec![first.id, second.id, third.id]);

        let mine = repo.list(Some("u1")).await.unwrap();
        assert_eq!(mine.len(), 2);

        let for_report = repo.get_by_workflow("report").await.unwrap();
        assert_eq!(for_report.len(), 2);
        assert!(for_report.iter().all(|r| r.workflow_id == "report"));
    }

    #[tokio::test]
    async fn test_record_run_bumps_count_and_clears_error() {
        let (repo, _dir) = test_repo().await;
        let rec = record("report", "u1", Utc::now());
        repo.create(&rec).await.unwrap();

        let next = Utc::now() + Duration::days(1);
        repo.record_run(
            &rec.id,
            &ScheduleRun {
                fired_at: Utc::now(),
                success: false,
                error: Some("agent unavailable".into()),
                next_run_at: Some(next),
            },
        )
        .await
        .unwrap();
        let after_fail = repo.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(after_fail.run_count, 1);
        assert_eq!(after_fail.last_error.as_deref(), Some("agent unavailable"));
        assert!(after_fail.last_run_at.is_some());

        repo.record_run(
            &rec.id,
            &ScheduleRun {
                fired_at: Utc::now(),
                success: true,
                error: None,
                next_run_at: Some(next),
            },
        )
        .await
        .unwrap();
        let after_ok = repo.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(after_ok.run_count, 2);
        assert!(after_ok.last_error.is_none());
        assert_eq!(after_ok.next_run_at.map(|t| t.timestamp()), Some(next.timestamp()));

        let err = repo
            .record_run(
                &Uuid::now_v7(),
                &ScheduleRun {
                    fired_at: Utc::now(),
                    success: true,
                    error: None,
                    next_run_at: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound), "got: {err}");
    }

    #[tokio::test]
    async fn test_pending_sync_and_delete() {
        let (repo, _dir) = test_repo().await;
        let pending = record("report", "u1", Utc::now());
        let mut synced = record("digest", "u1", Utc::now());
        synced.sync_state = SyncState::Synced;
        repo.create(&pending).await.unwrap();
        repo.create(&synced).await.unwrap();

        let listed = repo.list_pending_sync().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, pending.id);

        assert!(repo.delete(&pending.id).await.unwrap());
        assert!(!repo.delete(&pending.id).await.unwrap());
        assert!(repo.list_pending_sync().await.unwrap().is_empty());
    }
}
