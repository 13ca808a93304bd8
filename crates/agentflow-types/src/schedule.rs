//! Cron schedule records.
//!
//! Each `ScheduleRecord` is mirrored 1:1 by a schedule registered with the
//! durable substrate. `sync_state` tracks whether that mirror is known to
//! match the row.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    /// The durable mirror could not be updated and awaits reconciliation.
    PendingSync,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synced => f.write_str("synced"),
            Self::PendingSync => f.write_str("pending_sync"),
        }
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_sync" => Ok(Self::PendingSync),
            other => Err(format!("invalid sync state: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub owner: String,
    pub cron_expression: String,
    /// IANA timezone name the cron fields are interpreted in.
    pub timezone: String,
    pub enabled: bool,
    /// Static input passed to every run.
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Id of the durable-substrate registration, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_id: Option<String>,
    pub sync_state: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one fired schedule, written back onto the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub fired_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}
