//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions and their
//! executions. The infrastructure layer implements this trait with SQLite
//! persistence.

use agentflow_types::error::RepositoryError;
use agentflow_types::execution::Execution;
use agentflow_types::workflow::{DefinitionMetadata, StoredWorkflow, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers two entity families:
/// - **Definitions:** validated definitions keyed by their string id.
/// - **Executions:** one record per run, rewritten as the run advances.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition. `created_at` survives replacement.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
        metadata: &DefinitionMetadata,
    ) -> impl std::future::Future<Output = Result<StoredWorkflow, RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredWorkflow>, RepositoryError>> + Send;

    fn exists(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List definitions ordered by id, optionally filtered by owner.
    fn list_definitions(
        &self,
        owner: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<StoredWorkflow>, RepositoryError>> + Send;

    /// Delete a definition by id. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the stored record. Fails with `NotFound` for unknown ids.
    fn update_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Most recent executions of a workflow first.
    fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Executions parked on an approval step, oldest first.
    fn list_waiting_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;
}
