//! Step runner for agent, parallel, conditional and loop steps.
//!
//! `StepRunner` dispatches on `StepKind`. Each handler resolves its
//! templates from the namespace, runs through the durable substrate, and
//! returns a `StepCompletion` or a `StepFailure`. Approval steps suspend
//! the run, so the executor handles them itself.
//!
//! - Agent steps are substrate activities (`max_attempts = retries + 1`).
//! - Parallel branches are substrate child workflows, fanned out with a
//!   `JoinSet` and aggregated only after every branch has settled.
//! - Loop iterations run strictly in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentflow_types::execution::BranchResult;
use agentflow_types::workflow::{
    AgentStep, Aggregation, ConditionalStep, LoopMode, LoopStep, ParallelStep, StepKind,
    WorkflowStep,
};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::agent::{AgentInvocation, AgentOutput, BoxAgentInvoker};
use crate::substrate::{
    Activity, ActivityOptions, BoxFuture, ChildWorkflowOptions, DurableSubstrate, SubstrateError,
};

use super::condition::{ConditionKind, condition_holds};
use super::namespace::{LoopFrame, Namespace, truncate_output};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A step that finished successfully.
#[derive(Debug, Clone, Default)]
pub struct StepCompletion {
    pub output: String,
    /// Explicit routing override (conditional steps).
    pub next: Option<String>,
    pub branches: Vec<BranchResult>,
    pub iterations: Option<u32>,
}

impl StepCompletion {
    fn output(output: String) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }
}

/// A failed step plus whatever partial progress it made.
#[derive(Debug)]
pub struct StepFailure {
    pub error: StepError,
    pub output: Option<String>,
    pub branches: Vec<BranchResult>,
    pub iterations: Option<u32>,
}

impl From<StepError> for StepFailure {
    fn from(error: StepError) -> Self {
        Self {
            error,
            output: None,
            branches: Vec::new(),
            iterations: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step cannot run as defined (unbound agent, no approvers).
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Execution(String),

    #[error("approval for step '{0}' timed out")]
    ApprovalTimeout(String),

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("iteration {iteration} failed: {source}")]
    Iteration {
        iteration: u32,
        #[source]
        source: Box<StepError>,
    },
}

impl StepError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, StepError::Configuration(_))
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Identity of the run a step belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: Uuid,
    pub run_id: String,
    pub user_id: Option<String>,
}

pub struct StepRunner {
    invoker: BoxAgentInvoker,
    substrate: Arc<dyn DurableSubstrate>,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl StepRunner {
    pub fn new(
        invoker: BoxAgentInvoker,
        substrate: Arc<dyn DurableSubstrate>,
        default_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            invoker,
            substrate,
            default_timeout,
            max_output_bytes,
        }
    }

    /// Run one non-approval step against the namespace.
    pub async fn run(
        &self,
        step: &WorkflowStep,
        ns: &mut Namespace,
        run: &RunContext,
    ) -> Result<StepCompletion, StepFailure> {
        match &step.kind {
            StepKind::Agent(agent) => self.run_agent(step, agent, ns, run).await,
            StepKind::Parallel(parallel) => self.run_parallel(step, parallel, ns, run).await,
            StepKind::Conditional(cond) => run_conditional(step, cond, ns),
            StepKind::Loop(lp) => {
                let result = match step.timeout_secs {
                    Some(secs) => {
                        let deadline = Duration::from_secs(secs);
                        tokio::time::timeout(deadline, self.run_loop(step, lp, ns, run))
                            .await
                            .unwrap_or_else(|_| Err(StepError::Timeout(deadline).into()))
                    }
                    None => self.run_loop(step, lp, ns, run).await,
                };
                ns.exit_loop();
                result
            }
            StepKind::Approval(_) => Err(StepError::Configuration(format!(
                "approval step '{}' must be opened by the executor",
                step.id
            ))
            .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Agent
    // -----------------------------------------------------------------------

    async fn run_agent(
        &self,
        step: &WorkflowStep,
        agent: &AgentStep,
        ns: &mut Namespace,
        run: &RunContext,
    ) -> Result<StepCompletion, StepFailure> {
        let agent_id = bound_agent(&step.id, agent)?;
        let input = ns.resolve(&agent.input);
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let out = self
            .invoke_agent(
                agent_id,
                input,
                &step.id,
                format!("{}/{}", run.run_id, step.id),
                timeout,
                step.retries.saturating_add(1),
                run,
            )
            .await?;
        ns.merge_context(out.context_updates);
        Ok(StepCompletion::output(out.output))
    }

    /// Run one agent call as a retryable substrate activity.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_agent(
        &self,
        agent_id: &str,
        input: String,
        step_id: &str,
        activity_id: String,
        timeout: Duration,
        max_attempts: u32,
        run: &RunContext,
    ) -> Result<AgentOutput, StepError> {
        let invocation = AgentInvocation {
            agent_id: agent_id.to_string(),
            input,
            user_id: run.user_id.clone(),
            execution_id: run.execution_id,
            step_id: step_id.to_string(),
            timeout,
        };
        let invoker = self.invoker.clone();
        let activity: Activity =
            Arc::new(move |_attempt| agent_call(invoker.clone(), invocation.clone()));

        let options = ActivityOptions {
            activity_id,
            timeout,
            max_attempts,
        };
        let value = self
            .substrate
            .execute_activity(options, activity)
            .await
            .map_err(|e| agent_error(agent_id, e))?;
        let mut out = decode_output(value).map_err(StepError::Execution)?;
        out.output = truncate_output(out.output, self.max_output_bytes);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(
        &self,
        step: &WorkflowStep,
        parallel: &ParallelStep,
        ns: &mut Namespace,
        run: &RunContext,
    ) -> Result<StepCompletion, StepFailure> {
        if parallel.branches.is_empty() {
            return Err(StepError::Configuration(format!(
                "parallel step '{}' has no branches",
                step.id
            ))
            .into());
        }

        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();
        for (index, branch) in parallel.branches.iter().enumerate() {
            let timeout = branch
                .timeout_secs
                .or(step.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout);
            let invocation = AgentInvocation {
                agent_id: branch.agent_id.clone(),
                input: ns.resolve(&branch.input),
                user_id: run.user_id.clone(),
                execution_id: run.execution_id,
                step_id: step.id.clone(),
                timeout,
            };
            let options = ChildWorkflowOptions {
                child_id: format!("{}/{}/{}", run.run_id, step.id, index),
                timeout,
            };
            let body = agent_call(self.invoker.clone(), invocation);
            let substrate = Arc::clone(&self.substrate);

            let handle = tasks.spawn(async move {
                let started = Instant::now();
                let result = substrate
                    .execute_child_workflow(options, body)
                    .await
                    .map_err(|e| match e {
                        SubstrateError::ChildFailed { message, .. } => message,
                        SubstrateError::Timeout { after, .. } => format!("timed out after {after:?}"),
                        other => other.to_string(),
                    })
                    .and_then(decode_output);
                (index, result, started.elapsed().as_millis() as u64)
            });
            task_index.insert(handle.id(), index);
        }

        let mut settled: Vec<Option<(Result<AgentOutput, String>, u64)>> =
            (0..parallel.branches.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result, duration_ms)) => settled[index] = Some((result, duration_ms)),
                Err(e) => {
                    if let Some(&index) = task_index.get(&e.id()) {
                        settled[index] = Some((Err(format!("branch task aborted: {e}")), 0));
                    }
                }
            }
        }

        let mut branches = Vec::with_capacity(settled.len());
        let mut updates = Vec::with_capacity(settled.len());
        for (index, slot) in settled.into_iter().enumerate() {
            let agent_id = parallel.branches[index].agent_id.clone();
            let (result, duration_ms) =
                slot.unwrap_or_else(|| (Err("branch did not report a result".to_string()), 0));
            match result {
                Ok(out) => {
                    branches.push(BranchResult {
                        index,
                        agent_id,
                        success: true,
                        output: Some(truncate_output(out.output, self.max_output_bytes)),
                        error: None,
                        duration_ms,
                    });
                    updates.push(Some(out.context_updates));
                }
                Err(error) => {
                    branches.push(BranchResult {
                        index,
                        agent_id,
                        success: false,
                        output: None,
                        error: Some(error),
                        duration_ms,
                    });
                    updates.push(None);
                }
            }
        }

        tracing::debug!(
            execution_id = %run.execution_id,
            step_id = step.id.as_str(),
            branches = branches.len(),
            failed = branches.iter().filter(|b| !b.success).count(),
            "parallel branches settled"
        );

        match aggregate(&step.id, parallel.aggregation, &branches) {
            Ok(Aggregated { output, chosen }) => {
                let merge: Vec<Map<String, Value>> = match chosen {
                    Some(i) => updates.into_iter().nth(i).flatten().into_iter().collect(),
                    None => updates.into_iter().flatten().collect(),
                };
                for update in merge {
                    ns.merge_context(update);
                }
                Ok(StepCompletion {
                    output,
                    branches,
                    ..Default::default()
                })
            }
            Err(message) => Err(StepFailure {
                error: StepError::Execution(message),
                output: None,
                branches,
                iterations: None,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        step: &WorkflowStep,
        lp: &LoopStep,
        ns: &mut Namespace,
        run: &RunContext,
    ) -> Result<StepCompletion, StepFailure> {
        let items: Vec<Option<Value>> = match lp.loop_mode {
            LoopMode::Foreach => {
                let over = lp.over.as_deref().ok_or_else(|| {
                    StepError::Configuration(format!("foreach loop '{}' has no 'over' template", step.id))
                })?;
                let mut items = parse_foreach(&ns.resolve(over));
                if items.len() > lp.max_iterations as usize {
                    tracing::warn!(
                        step_id = step.id.as_str(),
                        items = items.len(),
                        max_iterations = lp.max_iterations,
                        "foreach list exceeds max_iterations, truncating"
                    );
                    items.truncate(lp.max_iterations as usize);
                }
                items.into_iter().map(Some).collect()
            }
            LoopMode::Count | LoopMode::Until => vec![None; lp.max_iterations as usize],
        };
        let total = items.len() as u32;

        let mut results: Vec<String> = Vec::new();
        let mut loop_previous: Option<String> = None;
        let mut executed = 0u32;

        for (i, item) in items.into_iter().enumerate() {
            let index = i as u32 + 1;
            ns.enter_loop(LoopFrame {
                index,
                total,
                item,
                previous: loop_previous.clone(),
            });

            if let Some(cond) = &lp.continue_condition {
                if condition_holds(cond, ConditionKind::Continue, ns) {
                    tracing::debug!(step_id = step.id.as_str(), index, "continue condition met, skipping iteration");
                    continue;
                }
            }

            let mut last_output = String::new();
            for inner in &lp.steps {
                let outcome = match bound_agent(&inner.id, &inner.agent) {
                    Ok(agent_id) => {
                        let timeout = inner
                            .timeout_secs
                            .map(Duration::from_secs)
                            .unwrap_or(self.default_timeout);
                        self.invoke_agent(
                            agent_id,
                            ns.resolve(&inner.agent.input),
                            &inner.id,
                            format!("{}/{}/{}/{}", run.run_id, step.id, index, inner.id),
                            timeout,
                            step.retries.saturating_add(1),
                            run,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(out) => {
                        ns.merge_context(out.context_updates);
                        ns.record_output(&inner.id, &out.output);
                        last_output = out.output;
                    }
                    Err(error) if lp.collect_results => {
                        return Err(StepFailure {
                            output: serde_json::to_string(&results).ok(),
                            error: StepError::Iteration {
                                iteration: index,
                                source: Box::new(error),
                            },
                            branches: Vec::new(),
                            iterations: Some(executed),
                        });
                    }
                    Err(error) => {
                        return Err(StepFailure {
                            error,
                            output: None,
                            branches: Vec::new(),
                            iterations: Some(executed),
                        });
                    }
                }
            }

            executed += 1;
            loop_previous = Some(last_output.clone());
            results.push(last_output);

            if let Some(cond) = &lp.break_condition {
                if condition_holds(cond, ConditionKind::Break, ns) {
                    tracing::debug!(step_id = step.id.as_str(), index, "break condition met");
                    break;
                }
            }
            if let Some(cond) = &lp.exit_condition {
                if condition_holds(cond, ConditionKind::Exit, ns) {
                    tracing::debug!(step_id = step.id.as_str(), index, "exit condition met");
                    break;
                }
            }
        }

        let output = if lp.collect_results {
            serde_json::to_string(&results).map_err(|e| StepError::Execution(e.to_string()))?
        } else {
            results.pop().unwrap_or_default()
        };
        Ok(StepCompletion {
            output,
            iterations: Some(executed),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

/// Route by case-insensitive substring match, first pattern wins.
fn run_conditional(
    step: &WorkflowStep,
    cond: &ConditionalStep,
    ns: &Namespace,
) -> Result<StepCompletion, StepFailure> {
    let resolved = ns.resolve(&cond.condition_source);
    let haystack = resolved.to_lowercase();
    let target = cond
        .branches
        .iter()
        .find(|b| haystack.contains(&b.pattern.to_lowercase()))
        .map(|b| b.target.clone())
        .or_else(|| cond.default.clone());

    match target {
        Some(target) => Ok(StepCompletion {
            output: resolved,
            next: Some(target),
            ..Default::default()
        }),
        None => {
            let preview: String = resolved.chars().take(80).collect();
            Err(StepError::Execution(format!(
                "no branch of conditional step '{}' matched '{preview}' and no default is set",
                step.id
            ))
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bound_agent<'a>(step_id: &str, agent: &'a AgentStep) -> Result<&'a str, StepError> {
    agent.bound_agent().ok_or_else(|| {
        let hint = agent
            .suggested_agent
            .as_deref()
            .map(|s| format!(" (suggested: '{s}')"))
            .unwrap_or_default();
        StepError::Configuration(format!("step '{step_id}' has no bound agent{hint}"))
    })
}

/// One agent call as a substrate body. Reported failures become `Err` so
/// the substrate can retry them.
fn agent_call(invoker: BoxAgentInvoker, invocation: AgentInvocation) -> BoxFuture<'static, Result<Value, String>> {
    Box::pin(async move {
        let out = invoker.invoke(&invocation).await.map_err(|e| e.to_string())?;
        if !out.success {
            return Err(out
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "agent reported failure".to_string()));
        }
        serde_json::to_value(out).map_err(|e| e.to_string())
    })
}

fn decode_output(value: Value) -> Result<AgentOutput, String> {
    serde_json::from_value(value).map_err(|e| format!("malformed agent result: {e}"))
}

fn agent_error(agent_id: &str, error: SubstrateError) -> StepError {
    match error {
        SubstrateError::ActivityFailed { attempts, message, .. } if attempts > 1 => {
            StepError::Execution(format!("agent '{agent_id}' failed after {attempts} attempts: {message}"))
        }
        SubstrateError::ActivityFailed { message, .. } => {
            StepError::Execution(format!("agent '{agent_id}' failed: {message}"))
        }
        SubstrateError::Timeout { after, .. } => {
            StepError::Execution(format!("agent '{agent_id}' timed out after {after:?}"))
        }
        other => StepError::Substrate(other),
    }
}

struct Aggregated {
    output: String,
    /// Branch whose context updates apply; `None` means every success.
    chosen: Option<usize>,
}

fn aggregate(step_id: &str, aggregation: Aggregation, branches: &[BranchResult]) -> Result<Aggregated, String> {
    let failures: Vec<String> = branches
        .iter()
        .filter(|b| !b.success)
        .map(|b| {
            format!(
                "branch {} ({}): {}",
                b.index,
                b.agent_id,
                b.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    let successes: Vec<&BranchResult> = branches.iter().filter(|b| b.success).collect();
    let all_failed = || {
        format!(
            "all {} branches of parallel step '{step_id}' failed: {}",
            branches.len(),
            failures.join("; ")
        )
    };

    match aggregation {
        Aggregation::All => {
            if !failures.is_empty() {
                return Err(format!(
                    "{} of {} branches of parallel step '{step_id}' failed: {}",
                    failures.len(),
                    branches.len(),
                    failures.join("; ")
                ));
            }
            let outputs: Vec<&str> = successes
                .iter()
                .map(|b| b.output.as_deref().unwrap_or_default())
                .collect();
            let output = serde_json::to_string(&outputs).map_err(|e| e.to_string())?;
            Ok(Aggregated { output, chosen: None })
        }
        Aggregation::First | Aggregation::Best => {
            if aggregation == Aggregation::Best {
                tracing::debug!(step_id, "'best' aggregation selects the first successful branch");
            }
            let first = successes.first().ok_or_else(all_failed)?;
            Ok(Aggregated {
                output: first.output.clone().unwrap_or_default(),
                chosen: Some(first.index),
            })
        }
        Aggregation::Merge => {
            if successes.is_empty() {
                return Err(all_failed());
            }
            let output = successes
                .iter()
                .map(|b| b.output.as_deref().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n\n");
            Ok(Aggregated { output, chosen: None })
        }
    }
}

/// Split a resolved `over` value into loop items.
///
/// Tried in order: a JSON array (or object, iterated as key/value
/// entries), comma-separated text, newline-separated text, then a single
/// scalar item. Blank input yields no items.
pub fn parse_foreach(text: &str) -> Vec<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => return items,
            Ok(Value::Object(map)) => {
                return map
                    .into_iter()
                    .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
                    .collect();
            }
            _ => {}
        }
    }
    let split = |sep: char| -> Vec<Value> {
        trimmed
            .split(sep)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect()
    };
    if trimmed.contains(',') {
        return split(',');
    }
    if trimmed.contains('\n') {
        return split('\n');
    }
    vec![Value::String(trimmed.to_string())]
}
