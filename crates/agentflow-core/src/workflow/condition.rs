//! Loop condition evaluation.
//!
//! `break_condition`, `continue_condition` and `exit_condition` are
//! templates. Evaluation rules:
//! - a template with a reference that cannot be resolved yet is false
//! - a resolved value of `true`, `yes` or `1` is true (exit conditions also
//!   accept `done` and `complete`); anything else resolved from a reference
//!   is false
//! - a template without references is a JEXL expression evaluated against
//!   the namespace (`steps.review.output == 'ok'`); evaluation errors are
//!   false
//!
//! **Security note:** resolved values are never parsed as expressions.
//! Namespace data reaches JEXL only as the context object.

use serde_json::{Value, json};

use super::namespace::Namespace;

const TRUE_WORDS: [&str; 3] = ["true", "yes", "1"];
const DONE_WORDS: [&str; 3] = ["done", "complete", "completed"];
const FALSE_WORDS: [&str; 4] = ["false", "no", "0", ""];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Which loop hook a condition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Break,
    Continue,
    Exit,
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with string transforms pre-registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;
        Ok(value_to_bool(&result))
    }

    /// Evaluate a loop condition template against the namespace.
    pub fn evaluate(&self, template: &str, kind: ConditionKind, ns: &Namespace) -> bool {
        let resolved = ns.resolve_tracked(template);
        if !resolved.unresolved.is_empty() {
            tracing::debug!(
                condition = template,
                unresolved = ?resolved.unresolved,
                "condition has unresolved references, treating as false"
            );
            return false;
        }

        let word = resolved.text.trim().to_lowercase();
        if TRUE_WORDS.contains(&word.as_str())
            || (kind == ConditionKind::Exit && DONE_WORDS.contains(&word.as_str()))
        {
            return true;
        }
        if FALSE_WORDS.contains(&word.as_str()) || resolved.text != template {
            return false;
        }

        match self.evaluate_bool(template, &ns.to_expression_context()) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(condition = template, error = %e, "condition evaluation failed, treating as false");
                false
            }
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate one loop condition with a throwaway evaluator.
///
/// The evaluator is built and dropped synchronously so it is never held
/// across an await point.
pub fn condition_holds(template: &str, kind: ConditionKind, ns: &Namespace) -> bool {
    ConditionEvaluator::new().evaluate(template, kind, ns)
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::namespace::LoopFrame;
    use serde_json::Map;

    fn ns_with_previous(previous: &str) -> Namespace {
        let mut ns = Namespace::new("input", Map::new());
        ns.record_output("review", previous);
        ns
    }

    #[test]
    fn test_keywords() {
        let eval = ConditionEvaluator::new();
        for word in ["true", "YES", " 1 "] {
            let ns = ns_with_previous(word);
            assert!(eval.evaluate("${previous}", ConditionKind::Break, &ns), "word: {word}");
        }
        for word in ["false", "no", "0", ""] {
            let ns = ns_with_previous(word);
            assert!(!eval.evaluate("${previous}", ConditionKind::Break, &ns), "word: {word}");
        }
    }

    #[test]
    fn test_done_only_counts_for_exit() {
        let eval = ConditionEvaluator::new();
        let ns = ns_with_previous("Done");
        assert!(eval.evaluate("${previous}", ConditionKind::Exit, &ns));
        assert!(!eval.evaluate("${previous}", ConditionKind::Break, &ns));
        let ns = ns_with_previous("complete");
        assert!(eval.evaluate("${previous}", ConditionKind::Exit, &ns));
    }

    #[test]
    fn test_free_text_from_reference_is_false() {
        let eval = ConditionEvaluator::new();
        let ns = ns_with_previous("steps.review.output == 'x' || true");
        assert!(!eval.evaluate("${previous}", ConditionKind::Exit, &ns));
    }

    #[test]
    fn test_unresolved_reference_is_false() {
        let eval = ConditionEvaluator::new();
        let ns = ns_with_previous("true");
        assert!(!eval.evaluate("${steps.missing.output}", ConditionKind::Break, &ns));
    }

    #[test]
    fn test_jexl_expression_against_namespace() {
        let eval = ConditionEvaluator::new();
        let ns = ns_with_previous("approved");
        assert!(eval.evaluate("steps.review.output == 'approved'", ConditionKind::Break, &ns));
        assert!(!eval.evaluate("steps.review.output == 'rejected'", ConditionKind::Break, &ns));
        assert!(eval.evaluate("previous|length > 3", ConditionKind::Break, &ns));
    }

    #[test]
    fn test_jexl_sees_loop_frame() {
        let eval = ConditionEvaluator::new();
        let mut ns = ns_with_previous("x");
        ns.enter_loop(LoopFrame {
            index: 2,
            total: 5,
            item: None,
            previous: None,
        });
        assert!(eval.evaluate("loop.index == 2", ConditionKind::Continue, &ns));
        assert!(!eval.evaluate("loop.last", ConditionKind::Break, &ns));
    }

    #[test]
    fn test_invalid_expression_is_false() {
        let eval = ConditionEvaluator::new();
        let ns = ns_with_previous("x");
        assert!(!eval.evaluate("((( not valid", ConditionKind::Break, &ns));
    }

    #[test]
    fn test_evaluate_bool_requires_object_context() {
        let eval = ConditionEvaluator::new();
        let err = eval.evaluate_bool("true", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }
}
