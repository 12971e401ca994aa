use serde_json::{json, Value};

use super::state::ExecutionState;

/// Resolves a dot-separated path against a JSON value. Total: a missing
/// segment or a non-container node yields `None`, never an error. Numeric
/// segments index into arrays. A leading `$` or `.` is tolerated.
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let normalized = normalized.strip_prefix('.').unwrap_or(normalized);
    if normalized.is_empty() {
        return Some(root.clone());
    }

    let mut current = root;
    for segment in normalized.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// The resolution root mappings and conditions see for a run.
pub fn scope_root(state: &ExecutionState) -> Value {
    json!({
        "workflow_id": state.workflow_id,
        "execution_id": state.execution_id.to_string(),
        "input": state.input,
        "variables": state.variables,
        "steps": state.step_results,
    })
}

/// Resolution over the run scope. Bare names that miss at the top level fall
/// back to `variables.<path>`, so conditions and mappings can reference
/// shared variables without the prefix.
pub fn resolve_scoped(root: &Value, path: &str) -> Option<Value> {
    if let Some(value) = resolve_path(root, path) {
        return Some(value);
    }
    resolve_path(root, &format!("variables.{path}"))
}
