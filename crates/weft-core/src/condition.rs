//! Edge condition evaluator.
//!
//! Decides which outgoing edges fire after a step finishes. Pure functions
//! over the edge descriptor, the producing step's status, the just-produced
//! output mapping, and the execution context. The evaluator is deliberately
//! lenient: unknown condition spellings pass, unresolvable fields evaluate
//! as absent, and coercion failures make comparisons false rather than
//! erroring.

use serde_json::{Map, Value};

use weft_types::execution::StepStatus;
use weft_types::workflow::{ConditionType, EdgeDescriptor};

use crate::context::ExecutionContext;

/// Evaluate an outgoing edge against the producing step's result.
///
/// Returns `true` when the edge's target should be dispatched.
pub fn evaluate_edge(
    edge: &EdgeDescriptor,
    step_status: StepStatus,
    output: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> bool {
    if !passes_legacy_gate(edge.condition.as_deref(), step_status) {
        return false;
    }

    if edge.condition_type == ConditionType::Always {
        return true;
    }

    let field = edge.condition_field.as_deref();
    let value = field.and_then(|f| resolve_field(f, output, ctx));

    match edge.condition_type {
        ConditionType::Always => true,
        ConditionType::IfNotEmpty => is_not_empty(value),
        ConditionType::IfEmpty => !is_not_empty(value),
        ConditionType::Equals => values_equal(value, edge.condition_value.as_ref()),
        ConditionType::NotEquals => !values_equal(value, edge.condition_value.as_ref()),
        ConditionType::Contains => contains(value, edge.condition_value.as_ref()),
        ConditionType::GreaterThan => {
            compare_numeric(value, edge.condition_value.as_ref(), |a, b| a > b)
        }
        ConditionType::LessThan => {
            compare_numeric(value, edge.condition_value.as_ref(), |a, b| a < b)
        }
    }
}

/// The legacy status gate: `always` passes, `success` requires a completed
/// step, `failure` requires a failed step, anything else passes.
fn passes_legacy_gate(condition: Option<&str>, status: StepStatus) -> bool {
    match condition.map(str::trim) {
        None | Some("") | Some("always") => true,
        Some("success") => status == StepStatus::Completed,
        Some("failure") => status == StepStatus::Failed,
        Some(_) => true,
    }
}

/// Resolve a condition field: the producing step's output first, then every
/// other step's output, then the global variables.
fn resolve_field<'a>(
    field: &str,
    output: &'a Map<String, Value>,
    ctx: &'a ExecutionContext,
) -> Option<&'a Value> {
    output.get(field).or_else(|| ctx.find_field(field))
}

/// Emptiness test: null, whitespace-only strings, empty sequences and
/// mappings, `false`, and zero are all empty.
fn is_not_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
    }
}

/// Equality: case-insensitive for string pairs, structural otherwise.
/// An unresolved field only equals an absent or null operand.
fn values_equal(value: Option<&Value>, operand: Option<&Value>) -> bool {
    match (value, operand) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.eq_ignore_ascii_case(b),
        (Some(a), Some(b)) => a == b,
        (None, Some(Value::Null)) | (Some(Value::Null), None) | (None, None) => true,
        _ => false,
    }
}

/// Containment: case-insensitive substring for strings, membership for
/// sequences, `false` for everything else.
fn contains(value: Option<&Value>, operand: Option<&Value>) -> bool {
    let (Some(value), Some(operand)) = (value, operand) else {
        return false;
    };
    match value {
        Value::String(haystack) => operand.as_str().is_some_and(|needle| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }),
        Value::Array(items) => items.iter().any(|item| match (item, operand) {
            (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => a == b,
        }),
        _ => false,
    }
}

/// Numeric comparison after coercion; `false` when either side fails to
/// coerce.
fn compare_numeric(
    value: Option<&Value>,
    operand: Option<&Value>,
    cmp: impl Fn(f64, f64) -> bool,
) -> bool {
    match (value.and_then(coerce_number), operand.and_then(coerce_number)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(value: Value) -> EdgeDescriptor {
        serde_json::from_value(value).unwrap()
    }

    fn output(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn eval(edge_json: Value, status: StepStatus, output_json: Value) -> bool {
        evaluate_edge(
            &edge(edge_json),
            status,
            &output(output_json),
            &ExecutionContext::new(),
        )
    }

    // -----------------------------------------------------------------------
    // Legacy gate
    // -----------------------------------------------------------------------

    #[test]
    fn legacy_gate_success_and_failure() {
        let e = json!({ "target_id": "next", "condition": "success" });
        assert!(eval(e.clone(), StepStatus::Completed, json!({})));
        assert!(!eval(e, StepStatus::Failed, json!({})));

        let e = json!({ "target_id": "next", "condition": "failure" });
        assert!(eval(e.clone(), StepStatus::Failed, json!({})));
        assert!(!eval(e, StepStatus::Completed, json!({})));
    }

    #[test]
    fn unknown_legacy_condition_passes() {
        let e = json!({ "target_id": "next", "condition": "whenever" });
        assert!(eval(e, StepStatus::Completed, json!({})));
    }

    // -----------------------------------------------------------------------
    // Emptiness
    // -----------------------------------------------------------------------

    #[test]
    fn if_not_empty_on_values() {
        let e = json!({
            "target_id": "next",
            "condition_type": "if_not_empty",
            "condition_field": "event_id"
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "event_id": "E1" })));
        assert!(!eval(e.clone(), StepStatus::Completed, json!({ "event_id": "" })));
        assert!(!eval(e.clone(), StepStatus::Completed, json!({ "event_id": "   " })));
        assert!(!eval(e.clone(), StepStatus::Completed, json!({ "event_id": [] })));
        assert!(!eval(e.clone(), StepStatus::Completed, json!({ "event_id": null })));
        assert!(!eval(e, StepStatus::Completed, json!({})));
    }

    #[test]
    fn if_empty_is_negation() {
        let e = json!({
            "target_id": "next",
            "condition_type": "if_empty",
            "condition_field": "event_id"
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "event_id": "" })));
        assert!(!eval(e, StepStatus::Completed, json!({ "event_id": "E1" })));
    }

    // -----------------------------------------------------------------------
    // Equality and containment
    // -----------------------------------------------------------------------

    #[test]
    fn equals_is_case_insensitive_for_strings() {
        let e = json!({
            "target_id": "next",
            "condition_type": "equals",
            "condition_field": "status",
            "condition_value": "Confirmed"
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "status": "confirmed" })));
        assert!(!eval(e, StepStatus::Completed, json!({ "status": "tentative" })));
    }

    #[test]
    fn equals_is_structural_for_non_strings() {
        let e = json!({
            "target_id": "next",
            "condition_type": "equals",
            "condition_field": "count",
            "condition_value": 3
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "count": 3 })));
        assert!(!eval(e, StepStatus::Completed, json!({ "count": 4 })));
    }

    #[test]
    fn not_equals_negates() {
        let e = json!({
            "target_id": "next",
            "condition_type": "if_not_equals",
            "condition_field": "status",
            "condition_value": "done"
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "status": "open" })));
        assert!(!eval(e, StepStatus::Completed, json!({ "status": "DONE" })));
    }

    #[test]
    fn contains_substring_and_membership() {
        let e = json!({
            "target_id": "next",
            "condition_type": "contains",
            "condition_field": "title",
            "condition_value": "standup"
        });
        assert!(eval(e, StepStatus::Completed, json!({ "title": "Daily Standup" })));

        let e = json!({
            "target_id": "next",
            "condition_type": "contains",
            "condition_field": "tags",
            "condition_value": "urgent"
        });
        assert!(eval(e.clone(), StepStatus::Completed, json!({ "tags": ["Urgent", "ops"] })));
        assert!(!eval(e, StepStatus::Completed, json!({ "tags": ["ops"] })));
    }

    #[test]
    fn contains_on_scalar_is_false() {
        let e = json!({
            "target_id": "next",
            "condition_type": "contains",
            "condition_field": "count",
            "condition_value": 1
        });
        assert!(!eval(e, StepStatus::Completed, json!({ "count": 12 })));
    }

    // -----------------------------------------------------------------------
    // Numeric comparison
    // -----------------------------------------------------------------------

    #[test]
    fn greater_and_less_than_coerce_strings() {
        let gt = json!({
            "target_id": "next",
            "condition_type": "greater_than",
            "condition_field": "attendees",
            "condition_value": "5"
        });
        assert!(eval(gt.clone(), StepStatus::Completed, json!({ "attendees": 7 })));
        assert!(!eval(gt, StepStatus::Completed, json!({ "attendees": "3" })));

        let lt = json!({
            "target_id": "next",
            "condition_type": "less_than",
            "condition_field": "attendees",
            "condition_value": 5
        });
        assert!(eval(lt, StepStatus::Completed, json!({ "attendees": "3" })));
    }

    #[test]
    fn comparison_with_uncoercible_side_is_false() {
        let e = json!({
            "target_id": "next",
            "condition_type": "greater_than",
            "condition_field": "attendees",
            "condition_value": "many"
        });
        assert!(!eval(e, StepStatus::Completed, json!({ "attendees": 7 })));
    }

    // -----------------------------------------------------------------------
    // Field resolution order
    // -----------------------------------------------------------------------

    #[test]
    fn field_resolves_from_context_when_absent_from_output() {
        let mut ctx = ExecutionContext::new();
        ctx.set_step_output("earlier", output(json!({ "status": "late" })));
        ctx.global_variables
            .insert("fallback".to_string(), json!("yes"));

        let from_steps = edge(json!({
            "target_id": "next",
            "condition_type": "equals",
            "condition_field": "status",
            "condition_value": "late"
        }));
        assert!(evaluate_edge(
            &from_steps,
            StepStatus::Completed,
            &Map::new(),
            &ctx
        ));

        let from_globals = edge(json!({
            "target_id": "next",
            "condition_type": "equals",
            "condition_field": "fallback",
            "condition_value": "yes"
        }));
        assert!(evaluate_edge(
            &from_globals,
            StepStatus::Completed,
            &Map::new(),
            &ctx
        ));
    }

    #[test]
    fn current_output_shadows_context() {
        let mut ctx = ExecutionContext::new();
        ctx.set_step_output("earlier", output(json!({ "status": "old" })));

        let e = edge(json!({
            "target_id": "next",
            "condition_type": "equals",
            "condition_field": "status",
            "condition_value": "new"
        }));
        assert!(evaluate_edge(
            &e,
            StepStatus::Completed,
            &output(json!({ "status": "new" })),
            &ctx
        ));
    }

    // -----------------------------------------------------------------------
    // Defaults
    // -----------------------------------------------------------------------

    #[test]
    fn absent_condition_type_passes() {
        let e = json!({ "target_id": "next" });
        assert!(eval(e, StepStatus::Completed, json!({})));
    }
}
