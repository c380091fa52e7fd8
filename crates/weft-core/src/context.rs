//! Per-execution dataflow state: step outputs, global variables, input
//! assembly, and template substitution.
//!
//! An [`ExecutionContext`] is the mutable bag of data that flows through one
//! workflow execution: a flat output mapping per completed step plus the
//! global variables accumulated along the way. The [`ContextStore`] caches
//! contexts per execution; persistence remains the source of truth, so a
//! lost context can be rebuilt from step execution and action result
//! records.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use weft_types::execution::{ActionResult, ActionStatus, StepExecution, StepStatus};

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable dataflow state for one workflow execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Flat output mapping per step id.
    pub step_data: HashMap<String, Map<String, Value>>,
    /// Variables visible to every step of the execution.
    pub global_variables: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the output mapping of a completed step.
    pub fn set_step_output(&mut self, step_id: &str, output: Map<String, Value>) {
        self.step_data.insert(step_id.to_string(), output);
    }

    /// Merge entries into the global variable set. Later writes win.
    pub fn merge_variables(&mut self, variables: &Map<String, Value>) {
        for (name, value) in variables {
            self.global_variables.insert(name.clone(), value.clone());
        }
    }

    /// Resolve a field by scanning every step output in insertion-agnostic
    /// order, then the global variables.
    pub fn find_field(&self, field: &str) -> Option<&Value> {
        self.step_data
            .values()
            .find_map(|output| output.get(field))
            .or_else(|| self.global_variables.get(field))
    }

    /// Assemble the input mapping for a step per its declared `input_data`.
    ///
    /// - `step.<id>.<field>` resolves from that step's output.
    /// - `variables.<name>` resolves from the global variables.
    /// - A bare `<field>` scans all step outputs, then the globals.
    /// - An empty declaration with a known predecessor passes the
    ///   predecessor's whole output mapping.
    ///
    /// Unresolvable tokens are skipped, not errors.
    pub fn assemble_inputs(
        &self,
        input_data: &[String],
        previous_step_id: Option<&str>,
    ) -> Map<String, Value> {
        if input_data.is_empty() {
            if let Some(prev) = previous_step_id {
                if let Some(output) = self.step_data.get(prev) {
                    return output.clone();
                }
            }
            return Map::new();
        }

        let mut inputs = Map::new();
        for token in input_data {
            if let Some(rest) = token.strip_prefix("step.") {
                if let Some((step_id, field)) = rest.split_once('.') {
                    if let Some(value) =
                        self.step_data.get(step_id).and_then(|out| out.get(field))
                    {
                        inputs.insert(field.to_string(), value.clone());
                    }
                }
            } else if let Some(name) = token.strip_prefix("variables.") {
                if let Some(value) = self.global_variables.get(name) {
                    inputs.insert(name.to_string(), value.clone());
                }
            } else if let Some(value) = self.find_field(token) {
                inputs.insert(token.clone(), value.clone());
            }
        }
        inputs
    }

    /// Rebuild a context from persisted records (crash recovery).
    ///
    /// Folds the successful action results of every completed step, in step
    /// creation order, through the same output-integration rule the
    /// scheduler applies live, then re-merges each step's variables.
    pub fn rebuild(steps: &[StepExecution], results: &[ActionResult]) -> Self {
        let mut ctx = Self::new();
        for step in steps {
            if step.status != StepStatus::Completed {
                continue;
            }
            let mut output = Map::new();
            for result in results {
                if result.step_execution_id == step.id
                    && result.status == ActionStatus::Success
                {
                    integrate_action_data(&mut output, &result.result);
                }
            }
            ctx.set_step_output(&step.step_id, output);
            ctx.merge_variables(&step.step_definition.variables);
        }
        ctx
    }
}

// ---------------------------------------------------------------------------
// Output integration
// ---------------------------------------------------------------------------

/// Merge one action's output data into a step's flat output mapping.
///
/// If the data carries a nested `data` mapping, that level is flattened
/// into the output; otherwise the mapping is merged as-is. Non-mapping data
/// is ignored.
pub fn integrate_action_data(output: &mut Map<String, Value>, data: &Value) {
    let Some(object) = data.as_object() else {
        return;
    };
    match object.get("data").and_then(Value::as_object) {
        Some(nested) => {
            for (key, value) in nested {
                output.insert(key.clone(), value.clone());
            }
        }
        None => {
            for (key, value) in object {
                output.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

/// Replace `${name}` and `{name}` placeholders in every string reachable
/// through the value, recursively through mappings and sequences.
///
/// Replacement values are stringified: strings verbatim, everything else as
/// compact JSON. Unmatched placeholders stay literal, which also makes the
/// substitution idempotent on fully-substituted values.
pub fn substitute_templates(value: &mut Value, inputs: &Map<String, Value>) {
    match value {
        Value::String(s) => {
            *s = substitute_str(s, inputs);
        }
        Value::Array(items) => {
            for item in items {
                substitute_templates(item, inputs);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_templates(item, inputs);
            }
        }
        _ => {}
    }
}

fn substitute_str(template: &str, inputs: &Map<String, Value>) -> String {
    let mut result = template.to_string();
    for (name, value) in inputs {
        let replacement = value_to_string(value);
        result = result.replace(&format!("${{{name}}}"), &replacement);
        result = result.replace(&format!("{{{name}}}"), &replacement);
    }
    result
}

/// Build the configuration a handler actually receives: the action config
/// with templates substituted, plus the input mapping merged into the root
/// so handlers can read fields directly. Existing config keys win over
/// inputs of the same name.
pub fn enrich_config(
    config: &Map<String, Value>,
    inputs: &Map<String, Value>,
) -> Map<String, Value> {
    let mut as_value = Value::Object(config.clone());
    substitute_templates(&mut as_value, inputs);
    let mut enriched = match as_value {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (name, value) in inputs {
        enriched.entry(name.clone()).or_insert_with(|| value.clone());
    }
    enriched
}

/// Convert a JSON value to a display string for template substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Process-local cache of execution contexts keyed by execution id.
///
/// Mutation happens only under the scheduler's per-step lock for the owning
/// execution, so a `DashMap` shard lock per access is all the coordination
/// needed.
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: DashMap<Uuid, ExecutionContext>,
}

impl ContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a context exists for the execution.
    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.contexts.contains_key(&execution_id)
    }

    /// Insert a context, replacing any existing one.
    pub fn insert(&self, execution_id: Uuid, ctx: ExecutionContext) {
        self.contexts.insert(execution_id, ctx);
    }

    /// Run a closure against the execution's context, creating an empty one
    /// first if needed.
    pub fn with_mut<T>(
        &self,
        execution_id: Uuid,
        f: impl FnOnce(&mut ExecutionContext) -> T,
    ) -> T {
        let mut entry = self.contexts.entry(execution_id).or_default();
        f(entry.value_mut())
    }

    /// Snapshot the execution's context, if present.
    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionContext> {
        self.contexts.get(&execution_id).map(|c| c.value().clone())
    }

    /// Drop the execution's context (terminal teardown).
    pub fn remove(&self, execution_id: Uuid) {
        self.contexts.remove(&execution_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
