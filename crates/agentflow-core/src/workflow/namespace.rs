//! Per-execution variable namespace and `${...}` template resolution.
//!
//! The namespace is owned by a single execution's interpreter loop and is
//! serialized into the execution checkpoint when a run suspends. Templates
//! reference:
//! - `${user_input}`: the execution input, verbatim
//! - `${previous}`: output of the most recently completed step
//! - `${context.<key>}`: workflow context, with dotted paths into objects
//! - `${steps.<id>.output}`: output of any step that already ran
//! - `${loop.index}`, `${loop.item}`, `${loop.previous}`, `${loop.total}`,
//!   `${loop.first}`, `${loop.last}`: only inside a loop body
//!
//! Substitution is single-pass: substituted text is never scanned again, and
//! references that cannot be resolved yet are left in place verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Appended to outputs cut at the size limit.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

// ---------------------------------------------------------------------------
// LoopFrame
// ---------------------------------------------------------------------------

/// Loop variables for the iteration currently running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFrame {
    /// 1-based iteration number.
    pub index: u32,
    pub total: u32,
    /// Current element (foreach only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    /// Output of the previous iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl LoopFrame {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        let (head, rest) = path.split_first()?;
        let value = match *head {
            "index" => json!(self.index),
            "total" => json!(self.total),
            "first" => json!(self.index == 1),
            "last" => json!(self.index == self.total),
            "previous" => Value::String(self.previous.clone()?),
            "item" => self.item.clone()?,
            _ => return None,
        };
        navigate(&value, rest).cloned()
    }
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// Variables visible to templates during one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    user_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<String>,
    #[serde(default)]
    context: Map<String, Value>,
    #[serde(default)]
    steps: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loop_frame: Option<LoopFrame>,
}

/// Result of resolving a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub text: String,
    /// References left verbatim because they had no value.
    pub unresolved: Vec<String>,
}

impl Namespace {
    /// Start a namespace. `previous` is seeded with the user input so a first
    /// step reading `${previous}` receives it.
    pub fn new(user_input: &str, context: Map<String, Value>) -> Self {
        Self {
            user_input: user_input.to_string(),
            previous: Some(user_input.to_string()),
            context,
            steps: BTreeMap::new(),
            loop_frame: None,
        }
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    pub fn step_output(&self, step_id: &str) -> Option<&str> {
        self.steps.get(step_id).map(String::as_str)
    }

    /// Record a completed step's output and make it `${previous}`.
    pub fn record_output(&mut self, step_id: &str, output: &str) {
        self.steps.insert(step_id.to_string(), output.to_string());
        self.previous = Some(output.to_string());
    }

    /// Merge context updates returned by an agent.
    pub fn merge_context(&mut self, updates: Map<String, Value>) {
        self.context.extend(updates);
    }

    pub fn enter_loop(&mut self, frame: LoopFrame) {
        self.loop_frame = Some(frame);
    }

    pub fn loop_frame_mut(&mut self) -> Option<&mut LoopFrame> {
        self.loop_frame.as_mut()
    }

    /// Drop all `loop.*` variables.
    pub fn exit_loop(&mut self) {
        self.loop_frame = None;
    }

    pub fn in_loop(&self) -> bool {
        self.loop_frame.is_some()
    }

    /// Look up a dotted reference such as `steps.fetch.output`.
    pub fn lookup(&self, reference: &str) -> Option<Value> {
        let path: Vec<&str> = reference.split('.').map(str::trim).collect();
        let (root, rest) = path.split_first()?;
        match *root {
            "user_input" if rest.is_empty() => Some(Value::String(self.user_input.clone())),
            "previous" if rest.is_empty() => self.previous.clone().map(Value::String),
            "context" => {
                let (key, rest) = rest.split_first()?;
                navigate(self.context.get(*key)?, rest).cloned()
            }
            "steps" => match rest {
                [id, "output"] => self.steps.get(*id).cloned().map(Value::String),
                _ => None,
            },
            "loop" => self.loop_frame.as_ref()?.lookup(rest),
            _ => None,
        }
    }

    /// Resolve `${...}` references, leaving unknown ones verbatim.
    pub fn resolve(&self, template: &str) -> String {
        self.resolve_tracked(template).text
    }

    /// Resolve and report which references stayed unresolved.
    pub fn resolve_tracked(&self, template: &str) -> Resolved {
        let mut text = String::with_capacity(template.len());
        let mut unresolved = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            text.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                // Unterminated reference: keep the remainder as-is
                text.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let reference = after[..end].trim();
            match self.lookup(reference) {
                Some(value) => text.push_str(&value_to_string(&value)),
                None => {
                    text.push_str(&rest[start..start + 2 + end + 1]);
                    unresolved.push(reference.to_string());
                }
            }
            rest = &after[end + 1..];
        }
        text.push_str(rest);

        Resolved { text, unresolved }
    }

    /// Prior step outputs, keyed by step id.
    pub fn outputs_snapshot(&self) -> Value {
        json!(self.steps)
    }

    /// JSON object handed to the expression evaluator.
    ///
    /// ```json
    /// {
    ///   "user_input": "...",
    ///   "previous": "...",
    ///   "context": { ... },
    ///   "steps": { "<id>": { "output": "..." } },
    ///   "loop": { "index": 1, "item": ..., "first": true, ... }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let steps: Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, output)| (id.clone(), json!({ "output": output })))
            .collect();
        let mut ctx = json!({
            "user_input": self.user_input,
            "previous": self.previous.clone().unwrap_or_default(),
            "context": self.context,
            "steps": steps,
        });
        if let (Some(frame), Some(obj)) = (&self.loop_frame, ctx.as_object_mut()) {
            obj.insert(
                "loop".to_string(),
                json!({
                    "index": frame.index,
                    "total": frame.total,
                    "first": frame.index == 1,
                    "last": frame.index == frame.total,
                    "item": frame.item.clone().unwrap_or(Value::Null),
                    "previous": frame.previous.clone().unwrap_or_default(),
                }),
            );
        }
        ctx
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn navigate<'a>(mut value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Convert a JSON value to a display string for template resolution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Cut `output` to at most `max_bytes` on a char boundary, marking the cut.
pub fn truncate_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = output[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
