//! CLI schedule subcommands.
//!
//! Schedules created here are registered with the in-process substrate only
//! while this command runs; `aflow serve` re-registers every stored schedule
//! at startup and keeps them firing.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use uuid::Uuid;

use agentflow_core::repository::WorkflowRepository;
use agentflow_core::workflow::schedule::{NewSchedule, ScheduleUpdate};
use agentflow_types::schedule::{ScheduleRecord, SyncState};

use crate::state::AppState;

/// Schedule subcommands.
#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Run a stored workflow on a cron schedule.
    Create {
        /// Workflow id.
        #[arg(long)]
        workflow: String,

        /// 5-field cron expression, e.g. "0 9 * * 1-5".
        #[arg(long)]
        cron: String,

        /// IANA timezone the expression is evaluated in.
        #[arg(long)]
        timezone: Option<String>,

        /// Text bound to `${user_input}` on each run.
        #[arg(long, default_value = "")]
        input: String,

        /// Owner recorded on the schedule.
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Store the schedule disabled.
        #[arg(long)]
        disabled: bool,
    },

    /// List schedules.
    #[command(alias = "ls")]
    List {
        /// Only show schedules for this workflow.
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Enable a disabled schedule.
    Enable {
        id: Uuid,
    },

    /// Disable a schedule without deleting it.
    Disable {
        id: Uuid,
    },

    /// Delete a schedule.
    #[command(alias = "rm")]
    Delete {
        /// Schedule UUID.
        id: Uuid,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a schedule subcommand.
pub async fn handle_schedule_command(cmd: ScheduleCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ScheduleCommand::Create {
            workflow,
            cron,
            timezone,
            input,
            owner,
            disabled,
        } => {
            if !state.workflows.exists(&workflow).await? {
                bail!("Workflow '{workflow}' not found");
            }
            let new = NewSchedule {
                workflow_id: workflow,
                cron_expression: cron,
                timezone,
                enabled: !disabled,
                input,
                context: serde_json::Map::new(),
            };
            let record = state.schedules.create(&owner, new).await?;
            print_record("Created", &record, json)
        }
        ScheduleCommand::List { workflow } => {
            let records = match workflow.as_deref() {
                Some(id) => state.schedules.get_by_workflow(id).await?,
                None => state.schedules.list(None).await?,
            };
            print_records(&records, json)
        }
        ScheduleCommand::Enable { id } => set_enabled(id, true, state, json).await,
        ScheduleCommand::Disable { id } => set_enabled(id, false, state, json).await,
        ScheduleCommand::Delete { id, force } => {
            let record = state.schedules.get(id).await?;
            if !force && !json {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Delete schedule '{}' for workflow '{}'?",
                        style(&record.cron_expression).red().bold(),
                        record.workflow_id
                    ))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("  Cancelled.");
                    return Ok(());
                }
            }
            state.schedules.delete(id).await?;
            if json {
                println!("{}", serde_json::json!({"deleted": true, "id": id}));
            } else {
                println!("  {} Deleted schedule {}", style("*").green().bold(), id);
            }
            Ok(())
        }
    }
}

async fn set_enabled(id: Uuid, enabled: bool, state: &AppState, json: bool) -> Result<()> {
    let changes = ScheduleUpdate {
        enabled: Some(enabled),
        ..ScheduleUpdate::default()
    };
    let record = state.schedules.update(id, changes).await?;
    print_record(if enabled { "Enabled" } else { "Disabled" }, &record, json)
}

fn print_record(verb: &str, record: &ScheduleRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} schedule {} for '{}'",
        style("*").green().bold(),
        verb,
        style(record.id).dim(),
        style(&record.workflow_id).cyan()
    );
    println!("  Cron:      {} ({})", record.cron_expression, record.timezone);
    if let Some(next) = record.next_run_at {
        println!("  Next run:  {}", next.format("%Y-%m-%d %H:%M UTC"));
    }
    if record.sync_state == SyncState::PendingSync {
        println!(
            "  {} Not yet registered with the substrate; it will be retried",
            style("!").yellow()
        );
    }
    println!();
    Ok(())
}

fn print_records(records: &[ScheduleRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No schedules.");
        println!(
            "  Create one with: {}",
            style("aflow schedule create --workflow <id> --cron \"0 9 * * 1-5\"").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Cron"),
            Cell::new("Timezone"),
            Cell::new("Enabled"),
            Cell::new("Sync"),
            Cell::new("Next run"),
            Cell::new("Runs"),
        ]);
    for r in records {
        let sync_color = match r.sync_state {
            SyncState::Synced => Color::Green,
            SyncState::PendingSync => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.workflow_id),
            Cell::new(&r.cron_expression),
            Cell::new(&r.timezone),
            Cell::new(if r.enabled { "yes" } else { "no" }),
            Cell::new(r.sync_state).fg(sync_color),
            Cell::new(
                r.next_run_at
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
            ),
            Cell::new(r.run_count),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
