//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Definitions arrive as JSON (REST surface) or YAML (files on disk) and are
//! validated before anything is stored or run: identifier format, step
//! counts, per-kind field rules, dangling references and cycles. Problems
//! that only matter at run time (draft agents, empty approver lists) are
//! returned as warnings so drafts can still be saved.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use agentflow_types::workflow::{
    AgentStep, ApprovalStep, LoopMode, LoopStep, MAX_LOOP_ITERATIONS, MAX_LOOP_STEPS,
    MAX_PARALLEL_BRANCHES, MAX_STEPS, ParallelStep, StepKind, WorkflowDefinition, WorkflowStep,
    is_valid_id,
};
use serde::Serialize;
use thiserror::Error;

use super::graph::StepGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Reasons a definition is rejected outright.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {kind} id '{id}': must match [A-Za-z][A-Za-z0-9_-]{{0,99}}")]
    InvalidId { kind: &'static str, id: String },

    #[error("workflow must have between 1 and 50 steps, got {0}")]
    StepCount(usize),

    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("entry_step references unknown step '{0}'")]
    UnknownEntryStep(String),

    #[error("step '{step}' {field} references unknown step '{target}'")]
    UnknownReference {
        step: String,
        field: &'static str,
        target: String,
    },

    /// Path of step ids forming the cycle, first id repeated at the end.
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("step '{step}' is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },

    #[error("step '{step}' {field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        step: String,
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("step '{step}' {field} must be greater than 0")]
    ZeroTimeout { step: String, field: &'static str },
}

/// Non-fatal finding reported next to a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

impl ValidationWarning {
    fn step(step_id: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON or YAML document into a validated definition.
///
/// Documents whose first non-blank character is `{` are read as JSON,
/// everything else as YAML.
pub fn parse_definition(content: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition = if content.trim_start().starts_with('{') {
        serde_json::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
    } else {
        serde_yaml_ng::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
    };
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_json::to_string_pretty(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow and step ids match the identifier pattern
/// - 1 to 50 steps, with unique ids
/// - `entry_step`, `on_error`, `on_reject`, branch and default targets exist
/// - Per-kind fields: bound or suggested agent, branch counts, loop bounds,
///   loop mode requirements, approval quorum, positive timeouts
/// - The step reference graph is acyclic
pub fn validate_definition(
    def: &WorkflowDefinition,
) -> Result<Vec<ValidationWarning>, DefinitionError> {
    if !is_valid_id(&def.id) {
        return Err(DefinitionError::InvalidId {
            kind: "workflow",
            id: def.id.clone(),
        });
    }
    if def.steps.is_empty() || def.steps.len() > MAX_STEPS {
        return Err(DefinitionError::StepCount(def.steps.len()));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !is_valid_id(&step.id) {
            return Err(DefinitionError::InvalidId {
                kind: "step",
                id: step.id.clone(),
            });
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::DuplicateStep(step.id.clone()));
        }
    }

    if let Some(entry) = &def.entry_step {
        if !seen_ids.contains(entry.as_str()) {
            return Err(DefinitionError::UnknownEntryStep(entry.clone()));
        }
    }

    let mut warnings = Vec::new();
    for step in &def.steps {
        check_timeout(&step.id, "timeout", step.timeout_secs)?;
        match &step.kind {
            StepKind::Agent(agent) => check_agent(&step.id, agent, &mut warnings)?,
            StepKind::Parallel(parallel) => check_parallel(step, parallel)?,
            StepKind::Conditional(cond) => {
                if cond.condition_source.trim().is_empty() {
                    return Err(missing(&step.id, "condition_source"));
                }
                if cond.branches.is_empty() && cond.default.is_none() {
                    return Err(missing(&step.id, "branches"));
                }
            }
            StepKind::Loop(lp) => check_loop(&step.id, lp, &mut warnings)?,
            StepKind::Approval(approval) => check_approval(&step.id, approval, &mut warnings)?,
        }
    }

    // Builds edges for every reference, rejecting dangling targets
    let graph = StepGraph::build(def)?;
    if let Some(cycle) = graph.find_cycle() {
        return Err(DefinitionError::Cycle(cycle));
    }
    if let Some(entry) = def.entry_step_id() {
        for id in graph.unreachable_from(entry) {
            warnings.push(ValidationWarning::step(
                &id,
                format!("step '{id}' is unreachable from entry step '{entry}'"),
            ));
        }
    }

    Ok(warnings)
}

fn missing(step: &str, field: &'static str) -> DefinitionError {
    DefinitionError::MissingField {
        step: step.to_string(),
        field,
    }
}

fn check_range(
    step: &str,
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), DefinitionError> {
    if value < min || value > max {
        return Err(DefinitionError::OutOfRange {
            step: step.to_string(),
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_timeout(step: &str, field: &'static str, timeout: Option<u64>) -> Result<(), DefinitionError> {
    if timeout == Some(0) {
        return Err(DefinitionError::ZeroTimeout {
            step: step.to_string(),
            field,
        });
    }
    Ok(())
}

fn check_agent(
    step: &str,
    agent: &AgentStep,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), DefinitionError> {
    if agent.bound_agent().is_some() {
        return Ok(());
    }
    match agent.suggested_agent.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(suggestion) => {
            warnings.push(ValidationWarning::step(
                step,
                format!("step '{step}' is a draft (suggested agent: {suggestion}) and cannot run until an agent_id is bound"),
            ));
            Ok(())
        }
        None => Err(missing(step, "agent_id")),
    }
}

fn check_parallel(step: &WorkflowStep, parallel: &ParallelStep) -> Result<(), DefinitionError> {
    check_range(
        &step.id,
        "branches",
        parallel.branches.len() as u64,
        1,
        MAX_PARALLEL_BRANCHES as u64,
    )?;
    for branch in &parallel.branches {
        if branch.agent_id.trim().is_empty() {
            return Err(missing(&step.id, "branches[].agent_id"));
        }
        check_timeout(&step.id, "branch timeout", branch.timeout_secs)?;
    }
    Ok(())
}

fn check_loop(
    step: &str,
    lp: &LoopStep,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), DefinitionError> {
    check_range(
        step,
        "max_iterations",
        lp.max_iterations as u64,
        1,
        MAX_LOOP_ITERATIONS as u64,
    )?;
    check_range(step, "steps", lp.steps.len() as u64, 1, MAX_LOOP_STEPS as u64)?;

    match lp.loop_mode {
        LoopMode::Foreach if lp.over.as_deref().is_none_or(|o| o.trim().is_empty()) => {
            return Err(missing(step, "over"));
        }
        LoopMode::Until if lp.exit_condition.as_deref().is_none_or(|c| c.trim().is_empty()) => {
            return Err(missing(step, "exit_condition"));
        }
        _ => {}
    }

    let mut inner_ids = HashSet::new();
    for inner in &lp.steps {
        if !is_valid_id(&inner.id) {
            return Err(DefinitionError::InvalidId {
                kind: "loop step",
                id: inner.id.clone(),
            });
        }
        if !inner_ids.insert(inner.id.as_str()) {
            return Err(DefinitionError::DuplicateStep(format!("{step}.{}", inner.id)));
        }
        check_timeout(&inner.id, "timeout", inner.timeout_secs)?;
        check_agent(&inner.id, &inner.agent, warnings)?;
    }
    Ok(())
}

fn check_approval(
    step: &str,
    approval: &ApprovalStep,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), DefinitionError> {
    check_range(
        step,
        "required_approvals",
        approval.required_approvals as u64,
        1,
        u32::MAX as u64,
    )?;
    check_timeout(step, "approval_timeout", approval.approval_timeout)?;

    let explicit: Vec<&String> = approval
        .approvers
        .iter()
        .filter(|a| !a.trim().is_empty())
        .collect();
    if explicit.is_empty() {
        warnings.push(ValidationWarning::step(
            step,
            format!("approval step '{step}' has no approvers and will fail when it runs"),
        ));
    } else {
        let has_patterns = explicit
            .iter()
            .any(|a| a.starts_with("role:") || a.contains('*'));
        if !has_patterns && approval.required_approvals as usize > explicit.len() {
            warnings.push(ValidationWarning::step(
                step,
                format!(
                    "approval step '{step}' requires {} approvals but lists only {} approvers",
                    approval.required_approvals,
                    explicit.len()
                ),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

fn is_json_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Load and validate a definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

/// Save a definition, as JSON for `.json` paths and YAML otherwise.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = if is_json_path(path) {
        serialize_workflow_json(def)?
    } else {
        serialize_workflow_yaml(def)?
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`, recursively.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow_file = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json");
        if !is_workflow_file {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
