//! CEL constraint engine (C5).
//!
//! Wraps `cel-interpreter`: compiles expressions once per policy load and caches the
//! program, evaluates with a typed activation built from the caller's input map.
//! Also exposes the `IamCondition` dialect used for temporary-access conditions on
//! cloud IAM bindings.

use cel_interpreter::{Context, Program, Value};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Distinguishes a user-input problem (expression evaluated to `false`) from a
/// configuration problem (compile error, undeclared variable, evaluation throw).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintOutcome {
    Satisfied,
    Unsatisfied(String),
    Failed(String),
}

pub struct CelEngine {
    cache: Mutex<HashMap<String, Program>>,
}

impl Default for CelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CelEngine {
    pub fn new() -> Self {
        CelEngine { cache: Mutex::new(HashMap::new()) }
    }

    pub fn compile(&self, expression: &str) -> Result<(), String> {
        if self.cache.lock().contains_key(expression) {
            return Ok(());
        }
        let program = Program::compile(expression).map_err(|e| e.to_string())?;
        self.cache.lock().insert(expression.to_string(), program);
        Ok(())
    }

    /// Evaluate a boolean CEL expression against a typed input map. A non-boolean
    /// result or an evaluation error is a configuration problem (`Failed`), not a
    /// user-facing denial.
    pub fn check(&self, expression: &str, input: &HashMap<String, serde_json::Value>) -> ConstraintOutcome {
        let mut cache = self.cache.lock();
        if !cache.contains_key(expression) {
            match Program::compile(expression) {
                Ok(p) => {
                    cache.insert(expression.to_string(), p);
                }
                Err(e) => return ConstraintOutcome::Failed(format!("compile error: {e}")),
            }
        }
        let program = cache.get(expression).unwrap();

        let mut context = Context::default();
        for (k, v) in input {
            if let Err(e) = add_json_variable(&mut context, k, v) {
                return ConstraintOutcome::Failed(format!("invalid variable {k}: {e}"));
            }
        }

        match program.execute(&context) {
            Ok(Value::Bool(true)) => ConstraintOutcome::Satisfied,
            Ok(Value::Bool(false)) => ConstraintOutcome::Unsatisfied(format!("{expression} evaluated to false")),
            Ok(other) => ConstraintOutcome::Failed(format!("expression did not evaluate to a boolean: {other:?}")),
            Err(e) => ConstraintOutcome::Failed(format!("evaluation error (likely an undeclared variable): {e}")),
        }
    }
}

fn add_json_variable(context: &mut Context, key: &str, value: &serde_json::Value) -> Result<(), String> {
    match value {
        serde_json::Value::Bool(b) => context.add_variable(key, *b).map_err(|e| e.to_string()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                context.add_variable(key, i).map_err(|e| e.to_string())
            } else if let Some(f) = n.as_f64() {
                context.add_variable(key, f).map_err(|e| e.to_string())
            } else {
                Err("unsupported number".into())
            }
        }
        serde_json::Value::String(s) => context.add_variable(key, s.clone()).map_err(|e| e.to_string()),
        other => Err(format!("unsupported variable type: {other:?}")),
    }
}

/// A temporary-access condition carried on a cloud IAM binding.
pub struct TemporaryIamCondition {
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

impl TemporaryIamCondition {
    pub fn new(start: DateTime<Utc>, duration: Duration) -> Self {
        TemporaryIamCondition { start, duration }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.duration
    }

    pub fn to_expression(&self) -> String {
        format!(
            "request.time >= timestamp(\"{}\") && request.time < timestamp(\"{}\")",
            self.start.to_rfc3339(),
            self.end().to_rfc3339()
        )
    }
}

/// Evaluates an `IamCondition` expression with a synthetic `request.time = now`.
/// Compile errors are a configuration problem; callers decide whether to surface
/// that as `ConstraintFailed` (validation) or an audit event (live reconciliation).
pub fn evaluate_iam_condition(expression: &str, now: DateTime<Utc>) -> Result<bool, String> {
    let program = Program::compile(expression).map_err(|e| e.to_string())?;
    let mut context = Context::default();
    // `to_expression()` compares against `timestamp(...)` literals, so `request.time`
    // must be a CEL timestamp, not a string, or every comparison is a type error.
    let request = std::collections::HashMap::from([("time", Value::Timestamp(now.fixed_offset()))]);
    context.add_variable("request", request).map_err(|e| e.to_string())?;
    match program.execute(&context) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(other) => Err(format!("condition did not evaluate to a boolean: {other:?}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_expression() {
        let cel = CelEngine::new();
        let mut input = HashMap::new();
        input.insert("region".to_string(), serde_json::json!("eu"));
        assert_eq!(cel.check("region == \"eu\"", &input), ConstraintOutcome::Satisfied);
    }

    #[test]
    fn unsatisfied_expression_is_distinct_from_failed() {
        let cel = CelEngine::new();
        let mut input = HashMap::new();
        input.insert("region".to_string(), serde_json::json!("us"));
        assert!(matches!(cel.check("region == \"eu\"", &input), ConstraintOutcome::Unsatisfied(_)));
    }

    #[test]
    fn undeclared_variable_is_failed_not_unsatisfied() {
        let cel = CelEngine::new();
        let input = HashMap::new();
        assert!(matches!(cel.check("region == \"eu\"", &input), ConstraintOutcome::Failed(_)));
    }

    #[test]
    fn compile_error_is_failed() {
        let cel = CelEngine::new();
        let input = HashMap::new();
        assert!(matches!(cel.check("region ==", &input), ConstraintOutcome::Failed(_)));
    }

    #[test]
    fn temporary_condition_round_trips_through_evaluate() {
        let now = Utc::now();
        let cond = TemporaryIamCondition::new(now - Duration::minutes(1), Duration::minutes(10));
        let expr = cond.to_expression();
        assert!(evaluate_iam_condition(&expr, now).unwrap());
        assert!(!evaluate_iam_condition(&expr, now + Duration::minutes(20)).unwrap());
    }
}
