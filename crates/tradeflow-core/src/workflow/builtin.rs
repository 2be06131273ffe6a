//! Pure built-in step executors: `data_transform`, `data_validate`, and the
//! log-sink `notification`.
//!
//! I/O-backed capabilities (HTTP, SQL, AI, webhooks) live in
//! `tradeflow-infra` and are registered on top of these.

use serde_json::{Map, Value, json};
use tradeflow_types::workflow::StepKind;

use super::context::lookup_path;
use super::executor::{ExecutorRegistry, StepError, StepExecutor, StepOutcome, StepRequest};

/// Register every executor in this module.
pub fn register_builtins(registry: &mut ExecutorRegistry) {
    registry.register(StepKind::DataTransform, TransformExecutor);
    registry.register(StepKind::DataValidate, ValidateExecutor);
    registry.register(StepKind::Notification, LogNotificationExecutor);
}

// ---------------------------------------------------------------------------
// data_transform
// ---------------------------------------------------------------------------

/// Reshape the step input.
///
/// Config parameters:
/// - `pick`: list of top-level input fields to keep
/// - `mappings`: `{ output_key: "dot.path.in.input" }`
/// - `constants`: `{ output_key: value }`, applied last
/// - `context_key`: also export the output as this top-level context key
///
/// Without `pick` or `mappings` the output starts as a copy of the input.
pub struct TransformExecutor;

impl StepExecutor for TransformExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let input = &request.input;

        let pick = config.param("pick").and_then(Value::as_array);
        let mappings = config.param("mappings").and_then(Value::as_object);

        let mut output = match (pick, mappings) {
            (None, None) => match input {
                Value::Object(map) => map.clone(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            },
            _ => Map::new(),
        };

        if let Some(fields) = pick {
            for field in fields.iter().filter_map(Value::as_str) {
                if let Some(value) = input.get(field) {
                    output.insert(field.to_string(), value.clone());
                }
            }
        }

        let mut unresolved = 0u32;
        if let Some(mappings) = mappings {
            for (target, path) in mappings {
                let path = path.as_str().ok_or_else(|| {
                    StepError::InvalidInput(format!("mapping for '{target}' must be a string path"))
                })?;
                match lookup_path(input, path) {
                    Some(value) => {
                        output.insert(target.clone(), value.clone());
                    }
                    None => unresolved += 1,
                }
            }
        }

        if let Some(constants) = config.param("constants").and_then(Value::as_object) {
            for (key, value) in constants {
                output.insert(key.clone(), value.clone());
            }
        }

        let fields = output.len() as f64;
        let output = Value::Object(output);
        let mut outcome = StepOutcome::new(output.clone())
            .with_metric("fields", fields)
            .with_metric("unresolved_mappings", f64::from(unresolved));
        if let Some(key) = config.param_str("context_key") {
            outcome = outcome.with_update(key, output);
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// data_validate
// ---------------------------------------------------------------------------

/// Check the step input against declarative rules.
///
/// Config parameters:
/// - `required`: list of dot-paths that must be present and non-null
/// - `rules`: `{ path: { type, min, max } }` where `type` is one of
///   `string`, `number`, `integer`, `boolean`, `array`, `object`; `min` /
///   `max` bound numbers by value and strings / arrays by length
/// - `fail_on_error` (default `true`): fail the step when violations exist,
///   otherwise report them in the output
pub struct ValidateExecutor;

impl StepExecutor for ValidateExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let input = &request.input;
        let mut errors: Vec<String> = Vec::new();
        let mut checked = 0u32;

        if let Some(required) = config.param("required").and_then(Value::as_array) {
            for path in required.iter().filter_map(Value::as_str) {
                checked += 1;
                if lookup_path(input, path).is_none_or(Value::is_null) {
                    errors.push(format!("'{path}' is required"));
                }
            }
        }

        if let Some(rules) = config.param("rules").and_then(Value::as_object) {
            for (path, rule) in rules {
                checked += 1;
                if let Some(value) = lookup_path(input, path) {
                    check_rule(path, value, rule, &mut errors);
                }
            }
        }

        let fail_on_error = config.param_bool("fail_on_error").unwrap_or(true);
        if fail_on_error && !errors.is_empty() {
            return Err(StepError::ExecutionFailed(format!(
                "validation failed: {}",
                errors.join("; ")
            )));
        }

        Ok(StepOutcome::new(json!({
            "valid": errors.is_empty(),
            "errors": errors,
            "checked": checked,
            "data": input,
        }))
        .with_metric("checked", f64::from(checked))
        .with_metric("violations", errors.len() as f64))
    }
}

fn check_rule(path: &str, value: &Value, rule: &Value, errors: &mut Vec<String>) {
    if let Some(expected) = rule.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            other => {
                errors.push(format!("'{path}' has unknown rule type '{other}'"));
                return;
            }
        };
        if !ok {
            errors.push(format!("'{path}' must be of type {expected}"));
            return;
        }
    }

    let measured = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(a) => Some(a.len() as f64),
        _ => None,
    };
    let Some(measured) = measured else {
        return;
    };
    if let Some(min) = rule.get("min").and_then(Value::as_f64) {
        if measured < min {
            errors.push(format!("'{path}' is below minimum {min}"));
        }
    }
    if let Some(max) = rule.get("max").and_then(Value::as_f64) {
        if measured > max {
            errors.push(format!("'{path}' exceeds maximum {max}"));
        }
    }
}

// ---------------------------------------------------------------------------
// notification (log sink)
// ---------------------------------------------------------------------------

/// Emit a notification as a structured log line.
///
/// `message` is rendered with `{{ path }}` placeholders against the execution
/// context; `level` is `info` (default), `warn` or `error`.
pub struct LogNotificationExecutor;

impl StepExecutor for LogNotificationExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let template = config
            .param_str("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("workflow step '{}' reached", request.step.name));
        let message = request.context.render(&template);
        let level = config.param_str("level").unwrap_or("info");

        match level {
            "error" => tracing::error!(execution_id = %request.execution_id, step = %request.step.name, %message, "notification"),
            "warn" => tracing::warn!(execution_id = %request.execution_id, step = %request.step.name, %message, "notification"),
            _ => tracing::info!(execution_id = %request.execution_id, step = %request.step.name, %message, "notification"),
        }

        Ok(StepOutcome::new(json!({
            "delivered": true,
            "channel": "log",
            "message": message,
        })))
    }
}
