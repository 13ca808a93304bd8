//! CLI workflow subcommands.
//!
//! Provides validate, import, export, list, show, run, executions, status and
//! delete operations for workflow definitions and their executions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

use agentflow_core::repository::WorkflowRepository;
use agentflow_core::workflow::definition::{
    discover_workflows, load_workflow_file, save_workflow_file, serialize_workflow_yaml,
    validate_definition,
};
use agentflow_types::event::WorkflowEvent;
use agentflow_types::execution::{Execution, ExecutionStatus, StepStatus};
use agentflow_types::workflow::DefinitionStatus;

use crate::state::AppState;

/// Workflow subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate a definition file without storing it.
    Validate {
        /// Path to a `.json`, `.yaml` or `.yml` definition.
        file: PathBuf,
    },

    /// Store a definition file, or every definition under a directory.
    Import {
        /// Definition file or directory to scan recursively.
        path: PathBuf,

        /// Owner recorded on the stored definitions.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Write a stored definition as YAML (or JSON for `.json` paths).
    Export {
        /// Workflow id.
        id: String,

        /// Output path. Prints YAML to stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List {
        /// Only show workflows with this owner.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show a stored definition and its steps.
    Show {
        /// Workflow id.
        id: String,
    },

    /// Execute a workflow by id, or import and execute a definition file.
    Run {
        /// Workflow id or path to a definition file.
        target: String,

        /// Text bound to `${user_input}`.
        #[arg(long, short, default_value = "")]
        input: String,

        /// User the execution runs as.
        #[arg(long)]
        user: Option<String>,

        /// JSON object merged over the definition's context.
        #[arg(long)]
        context: Option<String>,
    },

    /// List recent executions of a workflow.
    Executions {
        /// Workflow id.
        id: String,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show one execution and its step results.
    Status {
        /// Execution UUID.
        execution_id: uuid::Uuid,
    },

    /// Delete a workflow and its schedules. Executions are kept.
    #[command(alias = "rm")]
    Delete {
        /// Workflow id.
        id: String,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Import { path, owner } => handle_import(&path, owner.as_deref(), state, json).await,
        WorkflowCommand::Export { id, output } => handle_export(&id, output.as_deref(), state, json).await,
        WorkflowCommand::List { owner } => handle_list(owner.as_deref(), state, json).await,
        WorkflowCommand::Show { id } => handle_show(&id, state, json).await,
        WorkflowCommand::Run {
            target,
            input,
            user,
            context,
        } => handle_run(&target, &input, user.as_deref(), context.as_deref(), state, json).await,
        WorkflowCommand::Executions { id, limit } => handle_executions(&id, limit, state, json).await,
        WorkflowCommand::Status { execution_id } => {
            let execution = state
                .workflows
                .get_execution(&execution_id)
                .await?
                .with_context(|| format!("Execution '{execution_id}' not found"))?;
            print_execution(&execution, json)
        }
        WorkflowCommand::Delete { id, force } => handle_delete(&id, force, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Validate / import / export
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)?;
    let warnings = validate_definition(&def)?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "steps": def.steps.len(),
            "draft": def.has_unbound_agents(),
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green().bold(),
        style(def.display_name()).cyan(),
        def.steps.len()
    );
    if def.has_unbound_agents() {
        println!(
            "  {} Some agent steps only suggest an agent; the workflow will be stored as a draft",
            style("!").yellow()
        );
    }
    for w in &warnings {
        match &w.step_id {
            Some(step) => println!("  {} {}: {}", style("!").yellow(), step, w.message),
            None => println!("  {} {}", style("!").yellow(), w.message),
        }
    }
    println!();
    Ok(())
}

async fn handle_import(path: &Path, owner: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let defs = if path.is_dir() {
        discover_workflows(path)?
            .into_iter()
            .map(|(_, def)| def)
            .collect::<Vec<_>>()
    } else {
        vec![load_workflow_file(path)?]
    };
    if defs.is_empty() {
        bail!("No workflow definitions found under {}", path.display());
    }

    let mut registered = Vec::with_capacity(defs.len());
    for def in &defs {
        registered.push(state.register_workflow(def, owner).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&registered)?);
        return Ok(());
    }

    println!();
    for r in &registered {
        let def = &r.stored.definition;
        let status = match r.stored.metadata.status {
            DefinitionStatus::Active => style("active").green(),
            DefinitionStatus::Draft => style("draft").yellow(),
        };
        println!(
            "  {} Imported '{}' ({}, {} steps)",
            style("*").green().bold(),
            style(&def.id).cyan(),
            status,
            def.steps.len()
        );
        for w in &r.warnings {
            println!("    {} {}", style("!").yellow(), w.message);
        }
    }
    println!();
    Ok(())
}

async fn handle_export(id: &str, output: Option<&Path>, state: &AppState, json: bool) -> Result<()> {
    let stored = state
        .workflows
        .get_definition(id)
        .await?
        .with_context(|| format!("Workflow '{id}' not found"))?;

    match output {
        Some(path) => {
            save_workflow_file(path, &stored.definition)?;
            if !json {
                println!("  Wrote {}", style(path.display()).cyan());
            }
        }
        None if json => println!("{}", serde_json::to_string_pretty(&stored.definition)?),
        None => print!("{}", serialize_workflow_yaml(&stored.definition)?),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

async fn handle_list(owner: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let stored = state.workflows.list_definitions(owner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    if stored.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!("  Import one with: {}", style("aflow workflow import <file.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Status"),
            Cell::new("Owner"),
            Cell::new("Updated"),
        ]);

    for s in &stored {
        let status_color = match s.metadata.status {
            DefinitionStatus::Active => Color::Green,
            DefinitionStatus::Draft => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(&s.definition.id),
            Cell::new(s.definition.display_name()),
            Cell::new(s.definition.steps.len()),
            Cell::new(s.metadata.status).fg(status_color),
            Cell::new(s.metadata.owner.as_deref().unwrap_or("-")),
            Cell::new(s.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let stored = state
        .workflows
        .get_definition(id)
        .await?
        .with_context(|| format!("Workflow '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    let def = &stored.definition;
    println!();
    println!("  {} ({})", style(def.display_name()).cyan().bold(), stored.metadata.status);
    if let Some(desc) = &def.description {
        println!("  {}", style(desc).dim());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Step").fg(Color::Cyan), Cell::new("Type"), Cell::new("Retries")]);
    for step in &def.steps {
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(step.kind_name()),
            Cell::new(step.retries),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

async fn handle_run(
    target: &str,
    input: &str,
    user: Option<&str>,
    context: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let context = parse_context(context)?;

    let path = Path::new(target);
    let workflow_id = if path.is_file() {
        let def = load_workflow_file(path)?;
        state.register_workflow(&def, user).await?;
        def.id
    } else {
        target.to_string()
    };

    let spinner = ProgressBar::new_spinner();
    if json {
        spinner.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(format!("Starting {workflow_id}..."));
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let mut events = state.events.subscribe();
    let progress = {
        let spinner = spinner.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(msg) = progress_message(&event) {
                            spinner.set_message(msg);
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let result = state.executor.execute(&workflow_id, input, user, context).await;
    progress.abort();
    spinner.finish_and_clear();

    print_execution(&result?, json)
}

fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(text) => match serde_json::from_str::<Value>(text).context("--context must be JSON")? {
            Value::Object(map) => Ok(map),
            _ => bail!("--context must be a JSON object"),
        },
    }
}

fn progress_message(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::StepStarted { step_id, step_type, .. } => Some(format!("Running {step_id} ({step_type})...")),
        WorkflowEvent::StepFailed { step_id, error, .. } => Some(format!("{step_id} failed: {error}")),
        WorkflowEvent::ApprovalRequested { step_id, .. } => Some(format!("Waiting for approval at {step_id}...")),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn handle_executions(id: &str, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let executions = state.workflows.list_executions(id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions for workflow '{id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("User"),
            Cell::new("Steps"),
            Cell::new("Started"),
            Cell::new("Duration"),
        ]);
    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(e.status).fg(status_color(e.status)),
            Cell::new(e.user_id.as_deref().unwrap_or("-")),
            Cell::new(e.steps_executed.len()),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(e.duration_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"))),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::WaitingForApproval => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
    }
}

/// Print an execution summary and its step table.
pub(crate) fn print_execution(execution: &Execution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }

    let status = match execution.status {
        ExecutionStatus::Completed => style(execution.status.to_string()).green().bold(),
        ExecutionStatus::Failed => style(execution.status.to_string()).red().bold(),
        _ => style(execution.status.to_string()).yellow().bold(),
    };
    println!();
    println!("  Execution {} {}", style(execution.id).dim(), status);
    println!("  Workflow:  {}", style(&execution.workflow_id).cyan());

    if !execution.steps_executed.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Duration"),
                Cell::new("Output"),
            ]);
        let mut seen = HashSet::new();
        for step_id in &execution.steps_executed {
            if !seen.insert(step_id) {
                continue;
            }
            let Some(result) = execution.step_results.get(step_id) else {
                continue;
            };
            let color = match result.status {
                StepStatus::Completed => Color::Green,
                StepStatus::Failed => Color::Red,
                _ => Color::Yellow,
            };
            let detail = result.error.as_deref().or(result.output.as_deref()).unwrap_or("");
            table.add_row(vec![
                Cell::new(step_id),
                Cell::new(result.status).fg(color),
                Cell::new(format!("{}ms", result.duration_ms)),
                Cell::new(truncate(detail, 60)),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(output) = &execution.output {
        println!();
        println!("  {}", style("Output").bold());
        println!("  {output}");
    }
    if let Some(error) = &execution.error {
        println!();
        println!("  {} {error}", style("Error:").red().bold());
    }
    if let Some(checkpoint) = &execution.checkpoint {
        println!();
        println!(
            "  Waiting on approval {} at step '{}'",
            style(checkpoint.approval_id).yellow(),
            checkpoint.step_id
        );
        println!(
            "  Respond with: {}",
            style(format!(
                "aflow approval respond {} --user <id> --approve",
                checkpoint.approval_id
            ))
            .dim()
        );
    }
    println!();
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(id: &str, force: bool, state: &AppState, json: bool) -> Result<()> {
    if !state.workflows.exists(id).await? {
        bail!("Workflow '{id}' not found");
    }

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete workflow '{}' and its schedules?",
                style(id).red().bold()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let deleted = state.delete_workflow(id).await?;
    if json {
        println!("{}", serde_json::json!({"deleted": deleted, "id": id}));
    } else {
        println!("  {} Deleted workflow '{}'", style("*").green().bold(), id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_requires_object() {
        assert!(parse_context(None).unwrap().is_empty());
        let map = parse_context(Some(r#"{"tone": "formal"}"#)).unwrap();
        assert_eq!(map["tone"], "formal");

        let err = parse_context(Some("[1, 2]")).unwrap_err().to_string();
        assert!(err.contains("JSON object"), "got: {err}");
    }

    #[test]
    fn test_truncate_flattens_and_shortens() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("line one\nline two", 100), "line one line two");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn test_progress_message_ignores_bookkeeping_events() {
        let id = uuid::Uuid::now_v7();
        let started = WorkflowEvent::StepStarted {
            execution_id: id,
            step_id: "draft".into(),
            step_type: "agent".into(),
        };
        assert_eq!(progress_message(&started).unwrap(), "Running draft (agent)...");

        let resumed = WorkflowEvent::ExecutionResumed {
            execution_id: id,
            step_id: "draft".into(),
        };
        assert!(progress_message(&resumed).is_none());
    }
}
