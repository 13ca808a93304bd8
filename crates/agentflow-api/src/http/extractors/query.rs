//! Query parameter extractors for list endpoints.

use serde::Deserialize;

/// Query parameters for the workflow list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct WorkflowListQuery {
    /// Only definitions owned by this user.
    pub owner: Option<String>,
}

/// Query parameters for execution history.
#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    /// Maximum number of executions to return (default 20, max 200).
    #[serde(default = "default_execution_limit")]
    pub limit: u32,
}

fn default_execution_limit() -> u32 {
    20
}

impl ExecutionListQuery {
    pub fn capped_limit(&self) -> u32 {
        self.limit.clamp(1, 200)
    }
}

/// Query parameters for the schedule list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct ScheduleListQuery {
    /// Only schedules for this workflow.
    pub workflow_id: Option<String>,
    /// Only schedules owned by this user.
    pub owner: Option<String>,
}

/// Query parameters for the cron preview endpoint.
#[derive(Debug, Deserialize)]
pub struct CronDescribeQuery {
    pub expression: String,
    /// IANA timezone name (default UTC).
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Number of upcoming fire times to list (default 5, max 50).
    #[serde(default = "default_preview_count")]
    pub count: usize,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_preview_count() -> usize {
    5
}

impl CronDescribeQuery {
    pub fn capped_count(&self) -> usize {
        self.count.clamp(1, 50)
    }
}
