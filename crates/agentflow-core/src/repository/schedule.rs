//! Schedule repository trait definition.

use agentflow_types::error::RepositoryError;
use agentflow_types::schedule::{ScheduleRecord, ScheduleRun};
use uuid::Uuid;

pub trait ScheduleRepository: Send + Sync {
    fn create(
        &self,
        record: &ScheduleRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the stored row. Fails with `NotFound` for unknown ids.
    fn update(
        &self,
        record: &ScheduleRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Returns `true` if the row existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ScheduleRecord>, RepositoryError>> + Send;

    fn get_by_workflow(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduleRecord>, RepositoryError>> + Send;

    /// All schedules, optionally filtered by owner, oldest first.
    fn list(
        &self,
        owner: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduleRecord>, RepositoryError>> + Send;

    /// Record one fired run: stamp `last_run_at`, bump `run_count`, store
    /// the error (cleared on success) and the next run time.
    fn record_run(
        &self,
        id: &Uuid,
        run: &ScheduleRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Rows whose durable mirror still needs to be pushed.
    fn list_pending_sync(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduleRecord>, RepositoryError>> + Send;
}
