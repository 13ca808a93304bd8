//! Workflow definition types.
//!
//! A `WorkflowDefinition` is an ordered list of typed steps plus routing
//! metadata (`entry_step`, `on_error` targets, conditional branch targets).
//! Step kinds form a tagged union (`StepKind`) so each variant carries only
//! its own fields. Structural validation (reference checks, cycle detection)
//! lives in `agentflow_core::workflow::definition`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum number of top-level steps in a workflow.
pub const MAX_STEPS: usize = 50;

/// Maximum number of branches in a parallel step.
pub const MAX_PARALLEL_BRANCHES: usize = 10;

/// Hard upper bound for `max_iterations` on a loop step.
pub const MAX_LOOP_ITERATIONS: u32 = 100;

/// Maximum number of inner steps in a loop body.
pub const MAX_LOOP_STEPS: usize = 10;

/// Maximum length of workflow and step identifiers.
pub const MAX_ID_LEN: usize = 100;

/// Returns true if `id` matches `[A-Za-z][A-Za-z0-9_-]{0,99}`.
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    id.len() <= MAX_ID_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn default_input() -> String {
    "${previous}".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_required_approvals() -> u32 {
    1
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative graph of agent steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier, unique per repository.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order. Sequential routing follows this order.
    pub steps: Vec<WorkflowStep>,
    /// First step to run. Defaults to the first declared step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_step: Option<String>,
    /// Initial values for the `context.*` namespace.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl WorkflowDefinition {
    /// The step execution starts from.
    pub fn entry_step_id(&self) -> Option<&str> {
        self.entry_step
            .as_deref()
            .or_else(|| self.steps.first().map(|s| s.id.as_str()))
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// True if any agent step (top-level or inside a loop body) is still a
    /// draft without a bound `agent_id`.
    pub fn has_unbound_agents(&self) -> bool {
        self.steps.iter().any(|step| match &step.kind {
            StepKind::Agent(agent) => agent.bound_agent().is_none(),
            StepKind::Loop(lp) => lp.steps.iter().any(|s| s.agent.bound_agent().is_none()),
            _ => false,
        })
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step identifier, unique within the workflow.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Per-step deadline in seconds.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extra attempts handed to the durable substrate as the activity retry
    /// policy. The executor itself never retries.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "OnError::is_fail")]
    pub on_error: OnError,
}

impl WorkflowStep {
    /// Lowercase kind name as it appears on the wire.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Kind-specific step configuration, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Agent(AgentStep),
    Parallel(ParallelStep),
    Conditional(ConditionalStep),
    Loop(LoopStep),
    Approval(ApprovalStep),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Agent(_) => "agent",
            Self::Parallel(_) => "parallel",
            Self::Conditional(_) => "conditional",
            Self::Loop(_) => "loop",
            Self::Approval(_) => "approval",
        }
    }
}

/// Single agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Draft placeholder describing the agent that should be bound here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_agent: Option<String>,
    /// Input template. Defaults to `${previous}`.
    #[serde(default = "default_input")]
    pub input: String,
}

impl AgentStep {
    /// The bound agent id, if any. Blank ids count as unbound.
    pub fn bound_agent(&self) -> Option<&str> {
        self.agent_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Concurrent fan-out to several agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    pub branches: Vec<ParallelBranch>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub agent_id: String,
    #[serde(default = "default_input")]
    pub input: String,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// How parallel branch outputs are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// JSON array of every output; fails if any branch failed.
    #[default]
    All,
    /// First successful branch in declaration order.
    First,
    /// Successful outputs joined by blank lines; fails only if all failed.
    Merge,
    /// Currently the same selection as `First`.
    Best,
}

/// Routes to a target step by substring match on a resolved template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalStep {
    pub condition_source: String,
    /// Pattern to target-step pairs, matched in declaration order.
    #[serde(with = "ordered_branches")]
    pub branches: Vec<ConditionBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionBranch {
    pub pattern: String,
    pub target: String,
}

/// Iterates a body of inner agent steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub loop_mode: LoopMode,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Template yielding the items to iterate (foreach only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_condition: Option<String>,
    #[serde(default)]
    pub collect_results: bool,
    pub steps: Vec<LoopInnerStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Count,
    Foreach,
    Until,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Count => "count",
            Self::Foreach => "foreach",
            Self::Until => "until",
        };
        f.write_str(s)
    }
}

/// A mini agent step inside a loop body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopInnerStep {
    pub id: String,
    #[serde(flatten)]
    pub agent: AgentStep,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Human approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Message template shown to approvers.
    pub approval_message: String,
    /// User ids, emails, `role:<name>` entries or `*` wildcard patterns.
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    /// Seconds until a pending request expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout: Option<u64>,
    /// Policy applied when the request is rejected. Defaults to `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<OnError>,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// What to do when a step fails: stop, continue, or jump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OnError {
    #[default]
    Fail,
    Skip,
    Goto(String),
}

impl OnError {
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail)
    }

    /// The jump target, if this policy routes to a step.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Goto(id) => Some(id),
            _ => None,
        }
    }
}

impl From<String> for OnError {
    fn from(value: String) -> Self {
        match value.as_str() {
            "fail" => Self::Fail,
            "skip" => Self::Skip,
            _ => Self::Goto(value),
        }
    }
}

impl From<OnError> for String {
    fn from(value: OnError) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Skip => f.write_str("skip"),
            Self::Goto(id) => f.write_str(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored definitions
// ---------------------------------------------------------------------------

/// Whether a stored definition can run as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Active,
    /// Contains unbound agent steps.
    Draft,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Draft => f.write_str("draft"),
        }
    }
}

impl std::str::FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "draft" => Ok(Self::Draft),
            other => Err(format!("invalid definition status: '{other}'")),
        }
    }
}

/// Metadata saved next to a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: DefinitionStatus,
}

/// A definition as persisted by a workflow repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWorkflow {
    pub definition: WorkflowDefinition,
    #[serde(flatten)]
    pub metadata: DefinitionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ordered branch map
// ---------------------------------------------------------------------------

/// Serializes conditional branches as a map while keeping declaration order.
mod ordered_branches {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::ConditionBranch;

    pub fn serialize<S: Serializer>(
        branches: &[ConditionBranch],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(branches.len()))?;
        for branch in branches {
            map.serialize_entry(&branch.pattern, &branch.target)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ConditionBranch>, D::Error> {
        deserializer.deserialize_map(BranchVisitor)
    }

    struct BranchVisitor;

    impl<'de> Visitor<'de> for BranchVisitor {
        type Value = Vec<ConditionBranch>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of pattern to target step id")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut branches = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((pattern, target)) = access.next_entry::<String, String>()? {
                branches.push(ConditionBranch { pattern, target });
            }
            Ok(branches)
        }
    }
}
