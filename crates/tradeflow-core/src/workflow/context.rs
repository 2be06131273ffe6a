//! Shared execution context for a workflow run.
//!
//! `ExecutionContext` is the JSON state that flows through a run. It starts as
//! `{workflow_id, execution_id, input_data, step_outputs: {}, steps: {}}`;
//! every completed step writes its output under `step_outputs.<step id>` and
//! `steps.<step name>`, and may merge extra top-level keys.

use serde_json::{Map, Value};
use tradeflow_types::workflow::{StepConfig, WorkflowStep};
use uuid::Uuid;

/// Top-level keys that step updates may not overwrite.
const RESERVED_KEYS: &[&str] = &["workflow_id", "execution_id", "input_data", "step_outputs", "steps"];

/// Mutable JSON state owned by the engine task of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    data: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(workflow_id: Uuid, execution_id: Uuid, input_data: Value) -> Self {
        let mut data = Map::new();
        data.insert("workflow_id".to_string(), Value::String(workflow_id.to_string()));
        data.insert("execution_id".to_string(), Value::String(execution_id.to_string()));
        data.insert("input_data".to_string(), input_data);
        data.insert("step_outputs".to_string(), Value::Object(Map::new()));
        data.insert("steps".to_string(), Value::Object(Map::new()));
        Self { data }
    }

    /// Rebuild a context from a persisted `context_data` value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(data) => Self { data },
            _ => Self { data: Map::new() },
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn input_data(&self) -> &Value {
        self.data.get("input_data").unwrap_or(&Value::Null)
    }

    /// `output_data` set by a step via context updates, or `{}`.
    pub fn output_data(&self) -> Value {
        self.data
            .get("output_data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn step_output(&self, step_id: &Uuid) -> Option<&Value> {
        self.data
            .get("step_outputs")
            .and_then(|outputs| outputs.get(step_id.to_string()))
    }

    /// Look up a dot-separated path (`input_data.items.0.sku`).
    ///
    /// Numeric segments index into arrays. Returns `None` for any missing
    /// segment.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let (first, rest) = match path.split_once('.') {
            Some((first, rest)) => (first, rest),
            None => (path, ""),
        };
        lookup_path(self.data.get(first)?, rest)
    }

    /// Build a step's input from its configuration.
    ///
    /// Starts from `default_inputs`, then overrides each `input_mapping` key
    /// with the value at its context path. Unresolvable paths leave the
    /// default in place. With neither configured, the run's `input_data` is
    /// used as-is.
    pub fn resolve_input(&self, config: &StepConfig) -> Value {
        if config.default_inputs.is_empty() && config.input_mapping.is_empty() {
            return self.input_data().clone();
        }

        let mut input = config.default_inputs.clone();
        for (key, path) in &config.input_mapping {
            match self.get_path(path) {
                Some(value) => {
                    input.insert(key.clone(), value.clone());
                }
                None => {
                    tracing::debug!(key, path, "input mapping path not found in context");
                }
            }
        }
        Value::Object(input)
    }

    /// Record a completed step's output and merge its context updates.
    pub fn apply_outcome(&mut self, step: &WorkflowStep, output: Value, updates: Map<String, Value>) {
        if let Some(Value::Object(outputs)) = self.data.get_mut("step_outputs") {
            outputs.insert(step.id.to_string(), output.clone());
        }
        if let Some(Value::Object(by_name)) = self.data.get_mut("steps") {
            by_name.insert(step.name.clone(), output);
        }
        for (key, value) in updates {
            if RESERVED_KEYS.contains(&key.as_str()) {
                tracing::warn!(step = %step.name, key, "ignoring update to reserved context key");
                continue;
            }
            self.data.insert(key, value);
        }
    }

    /// Replace every `{{ path }}` in `template` with the value at that path.
    ///
    /// Strings are inserted verbatim, other values as compact JSON. Unknown
    /// paths are left untouched.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len;
            let path = rest[start + 2..end].trim();
            out.push_str(&rest[..start]);
            match self.get_path(path) {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => out.push_str(&rest[start..end + 2]),
            }
            rest = &rest[end + 2..];
        }
        out.push_str(rest);
        out
    }

    /// Apply [`render`](Self::render) to every string inside `value`.
    ///
    /// A string that is exactly one `{{ path }}` placeholder is replaced by
    /// the referenced value itself, preserving its JSON type.
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if let Some(inner) = trimmed
                    .strip_prefix("{{")
                    .and_then(|t| t.strip_suffix("}}"))
                    .filter(|inner| !inner.contains("{{"))
                {
                    if let Some(found) = self.get_path(inner.trim()) {
                        return found.clone();
                    }
                }
                Value::String(self.render(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Walk a dot-separated path from `root`. Numeric segments index arrays; an
/// empty path returns `root`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
