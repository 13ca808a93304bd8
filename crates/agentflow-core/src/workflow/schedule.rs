//! Cron schedules mirrored onto the durable substrate.
//!
//! The `ScheduleRecord` row is the source of truth. Each enabled row has
//! one registration with the substrate, built from the parsed cron sets.
//! When the substrate cannot be reached the row is kept and marked
//! `pending_sync`; `reconcile` pushes it again later. A registration the
//! substrate refuses outright is an error and the row is not kept.

use std::sync::Arc;
use std::time::Duration;

use agentflow_types::error::RepositoryError;
use agentflow_types::execution::ExecutionStatus;
use agentflow_types::schedule::{ScheduleRecord, ScheduleRun, SyncState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::ScheduleRepository;
use crate::substrate::{
    BoxFuture, DurableSubstrate, ScheduleCallback, ScheduleFire, ScheduleRegistration,
    SubstrateError,
};

use super::cron::{self, CronError};
use super::executor::WorkflowLauncher;

const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidCron(#[from] CronError),

    #[error("schedule registration rejected: {0}")]
    Registration(String),

    #[error("schedule {0} not found")]
    NotFound(Uuid),

    #[error("durable substrate error: {0}")]
    Substrate(SubstrateError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Fields for a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub workflow_id: String,
    pub cron_expression: String,
    /// IANA timezone, `UTC` when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

fn enabled_by_default() -> bool {
    true
}

/// Partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// ScheduleService
// ---------------------------------------------------------------------------

pub struct ScheduleService<S: ScheduleRepository> {
    repo: Arc<S>,
    substrate: Arc<dyn DurableSubstrate>,
    launcher: Arc<dyn WorkflowLauncher>,
}

impl<S: ScheduleRepository> Clone for ScheduleService<S> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            substrate: Arc::clone(&self.substrate),
            launcher: Arc::clone(&self.launcher),
        }
    }
}

impl<S: ScheduleRepository + 'static> ScheduleService<S> {
    pub fn new(
        repo: Arc<S>,
        substrate: Arc<dyn DurableSubstrate>,
        launcher: Arc<dyn WorkflowLauncher>,
    ) -> Self {
        Self {
            repo,
            substrate,
            launcher,
        }
    }

    /// Validate, persist, then register.
    pub async fn create(&self, owner: &str, new: NewSchedule) -> Result<ScheduleRecord, ScheduleError> {
        let timezone = new.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let expr = cron::parse(&new.cron_expression)?;
        let now = Utc::now();
        let next_run_at = expr.next_run(now, cron::parse_timezone(&timezone)?)?;

        let mut record = ScheduleRecord {
            id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            owner: owner.to_string(),
            cron_expression: expr.as_str().to_string(),
            timezone,
            enabled: new.enabled,
            input: new.input,
            context: new.context,
            durable_id: None,
            sync_state: SyncState::PendingSync,
            next_run_at: Some(next_run_at),
            last_run_at: None,
            run_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.create(&record).await?;

        if let Err(SubstrateError::ScheduleRejected(reason)) = self.push(&mut record).await {
            self.repo.delete(&record.id).await?;
            return Err(ScheduleError::Registration(reason));
        }
        self.repo.update(&record).await?;

        tracing::info!(
            schedule_id = %record.id,
            workflow_id = record.workflow_id.as_str(),
            cron = record.cron_expression.as_str(),
            sync_state = %record.sync_state,
            "schedule created"
        );
        Ok(record)
    }

    pub async fn update(&self, id: Uuid, changes: ScheduleUpdate) -> Result<ScheduleRecord, ScheduleError> {
        let mut record = self.get(id).await?;
        let timing_changed = changes.cron_expression.is_some() || changes.timezone.is_some();
        let enabled_changed = changes.enabled.is_some_and(|e| e != record.enabled);

        if timing_changed {
            let cron_expression = changes
                .cron_expression
                .unwrap_or_else(|| record.cron_expression.clone());
            let timezone = changes.timezone.unwrap_or_else(|| record.timezone.clone());
            let expr = cron::parse(&cron_expression)?;
            let next_run_at = expr.next_run(Utc::now(), cron::parse_timezone(&timezone)?)?;
            record.cron_expression = expr.as_str().to_string();
            record.timezone = timezone;
            record.next_run_at = Some(next_run_at);
        }
        if let Some(enabled) = changes.enabled {
            record.enabled = enabled;
        }
        if let Some(input) = changes.input {
            record.input = input;
        }
        if let Some(context) = changes.context {
            record.context = context;
        }
        if record.enabled && enabled_changed && !timing_changed {
            record.next_run_at = Some(next_run_for(&record, Utc::now())?);
        }

        if timing_changed || enabled_changed || record.sync_state == SyncState::PendingSync {
            if let Err(SubstrateError::ScheduleRejected(reason)) = self.push(&mut record).await {
                return Err(ScheduleError::Registration(reason));
            }
        }
        record.updated_at = Utc::now();
        self.repo.update(&record).await?;

        tracing::info!(
            schedule_id = %record.id,
            enabled = record.enabled,
            sync_state = %record.sync_state,
            "schedule updated"
        );
        Ok(record)
    }

    /// Deregister first so a failed deregistration never leaves an orphaned
    /// trigger behind a deleted row.
    pub async fn delete(&self, id: Uuid) -> Result<(), ScheduleError> {
        let record = self.get(id).await?;
        if let Some(durable_id) = &record.durable_id {
            match self.substrate.delete_schedule(durable_id).await {
                Ok(()) | Err(SubstrateError::NotFound(_)) => {}
                Err(e) => return Err(ScheduleError::Substrate(e)),
            }
        }
        self.repo.delete(&id).await?;
        tracing::info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<ScheduleRecord, ScheduleError> {
        self.repo.get(&id).await?.ok_or(ScheduleError::NotFound(id))
    }

    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<ScheduleRecord>, ScheduleError> {
        Ok(self.repo.list(owner).await?)
    }

    pub async fn get_by_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduleRecord>, ScheduleError> {
        Ok(self.repo.get_by_workflow(workflow_id).await?)
    }

    /// Push every `pending_sync` row again. Returns how many are now synced.
    pub async fn reconcile(&self) -> Result<usize, ScheduleError> {
        let mut synced = 0;
        for mut record in self.repo.list_pending_sync().await? {
            match self.push(&mut record).await {
                Ok(()) => synced += 1,
                Err(SubstrateError::ScheduleRejected(reason)) => {
                    record.sync_state = SyncState::PendingSync;
                    record.last_error = Some(reason);
                }
                Err(_) => {}
            }
            record.updated_at = Utc::now();
            self.repo.update(&record).await?;
        }
        if synced > 0 {
            tracing::info!(synced, "reconciled pending schedules");
        }
        Ok(synced)
    }

    /// Re-register every enabled schedule after a restart.
    ///
    /// Runs missed while the process was down are logged and skipped;
    /// `next_run_at` moves to the next fire time after `now`.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let mut restored = 0;
        for mut record in self.repo.list(None).await? {
            if !record.enabled {
                continue;
            }
            if let Some(missed) = record.next_run_at.filter(|at| *at < now) {
                tracing::warn!(
                    schedule_id = %record.id,
                    workflow_id = record.workflow_id.as_str(),
                    missed_at = %missed,
                    "schedule missed a run while offline, skipping to next fire time"
                );
            }
            match next_run_for(&record, now) {
                Ok(next) => record.next_run_at = Some(next),
                Err(e) => {
                    tracing::warn!(schedule_id = %record.id, error = %e, "schedule cannot be restored");
                    record.sync_state = SyncState::PendingSync;
                    record.last_error = Some(e.to_string());
                    self.repo.update(&record).await?;
                    continue;
                }
            }
            if self.push(&mut record).await.is_ok() {
                restored += 1;
            }
            self.repo.update(&record).await?;
        }
        tracing::info!(restored, "schedules restored");
        Ok(restored)
    }

    /// Run `reconcile` every `interval` until cancelled.
    pub fn spawn_reconciler(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile().await {
                            tracing::warn!(error = %e, "schedule reconciliation failed");
                        }
                    }
                }
            }
            tracing::debug!("schedule reconciler stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Durable mirror
    // -----------------------------------------------------------------------

    /// Bring the substrate registration in line with the row and set
    /// `sync_state`. Rejections leave the row untouched for the caller.
    async fn push(&self, record: &mut ScheduleRecord) -> Result<(), SubstrateError> {
        match self.sync_durable(record).await {
            Ok(()) => {
                // A pending row's error came from a failed sync, not a run.
                if record.sync_state == SyncState::PendingSync {
                    record.last_error = None;
                }
                record.sync_state = SyncState::Synced;
                Ok(())
            }
            Err(SubstrateError::ScheduleRejected(reason)) => Err(SubstrateError::ScheduleRejected(reason)),
            Err(e) => {
                tracing::warn!(
                    schedule_id = %record.id,
                    error = %e,
                    "durable schedule sync failed, marked pending"
                );
                record.sync_state = SyncState::PendingSync;
                record.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn sync_durable(&self, record: &mut ScheduleRecord) -> Result<(), SubstrateError> {
        if !record.enabled {
            if let Some(durable_id) = record.durable_id.take() {
                match self.substrate.delete_schedule(&durable_id).await {
                    Ok(()) | Err(SubstrateError::NotFound(_)) => {}
                    Err(e) => {
                        record.durable_id = Some(durable_id);
                        return Err(e);
                    }
                }
            }
            return Ok(());
        }

        let registration = registration(record).map_err(|e| SubstrateError::ScheduleRejected(e.to_string()))?;
        if let Some(durable_id) = &record.durable_id {
            match self.substrate.update_schedule(durable_id, registration.clone()).await {
                Ok(()) => return Ok(()),
                Err(SubstrateError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let durable_id = self
            .substrate
            .register_schedule(registration, self.callback())
            .await?;
        record.durable_id = Some(durable_id);
        Ok(())
    }

    /// Callback the substrate invokes on every fire.
    fn callback(&self) -> ScheduleCallback {
        let repo = Arc::clone(&self.repo);
        let launcher = Arc::clone(&self.launcher);
        Arc::new(move |fire: ScheduleFire| -> BoxFuture<'static, ()> {
            let repo = Arc::clone(&repo);
            let launcher = Arc::clone(&launcher);
            Box::pin(async move { run_scheduled(repo.as_ref(), launcher.as_ref(), fire).await })
        })
    }
}

fn registration(record: &ScheduleRecord) -> Result<ScheduleRegistration, CronError> {
    let expr = cron::parse(&record.cron_expression)?;
    Ok(ScheduleRegistration {
        schedule_id: record.id,
        workflow_id: record.workflow_id.clone(),
        calendar: expr.calendar().clone(),
        timezone: cron::parse_timezone(&record.timezone)?,
    })
}

fn next_run_for(record: &ScheduleRecord, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    cron::next_run(&record.cron_expression, after, &record.timezone)
}

/// Launch the schedule's workflow and write the outcome back on the row.
async fn run_scheduled<S: ScheduleRepository>(repo: &S, launcher: &dyn WorkflowLauncher, fire: ScheduleFire) {
    let record = match repo.get(&fire.schedule_id).await {
        Ok(Some(record)) if record.enabled => record,
        Ok(_) => {
            tracing::debug!(schedule_id = %fire.schedule_id, "schedule fired but is gone or disabled");
            return;
        }
        Err(e) => {
            tracing::warn!(schedule_id = %fire.schedule_id, error = %e, "failed to load fired schedule");
            return;
        }
    };

    tracing::info!(
        schedule_id = %record.id,
        workflow_id = record.workflow_id.as_str(),
        fired_at = %fire.fired_at,
        "schedule fired"
    );
    let (success, error) = match launcher
        .launch(&record.workflow_id, &record.input, Some(&record.owner), record.context.clone())
        .await
    {
        Ok(execution) if execution.status == ExecutionStatus::Failed => (false, execution.error),
        Ok(_) => (true, None),
        Err(e) => (false, Some(e)),
    };

    let run = ScheduleRun {
        fired_at: fire.fired_at,
        success,
        error,
        next_run_at: fire.next_run_at,
    };
    if let Err(e) = repo.record_run(&record.id, &run).await {
        tracing::warn!(schedule_id = %record.id, error = %e, "failed to record schedule run");
    }
}
