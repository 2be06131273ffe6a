//! JEXL expression evaluator for step `expression` conditions.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms and
//! provides convenience methods for boolean evaluation over the execution
//! context.
//!
//! Context data is always passed as the evaluation context object, never
//! interpolated into expression strings. JEXL has no function calls beyond the
//! registered transforms, so an expression cannot reach outside its context.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Examples:
/// - `input_data.marketplace == 'amazon'`
/// - `steps.fetch_products.records|length > 0`
/// - `'electronics' in input_data.categories`
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
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
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().cloned().unwrap_or(Value::Null);
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(json!(value_contains(&subject, &needle)))
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
            })
            .with_transform("number", |args: &[Value]| {
                let n = match args.first() {
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                    Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
                    Some(Value::Bool(b)) => f64::from(u8::from(*b)),
                    _ => 0.0,
                };
                Ok(json!(n))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Expression results are coerced
    /// to boolean using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(truthy(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Substring for strings, membership for arrays, key lookup for objects.
pub fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Equality that treats `5` and `5.0` as the same number.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    #[test]
    fn test_dot_notation_nested() {
        let ctx = json!({ "input_data": { "supplier": { "name": "Acme" } } });
        let result = evaluator()
            .evaluate_value("input_data.supplier.name", &ctx)
            .unwrap();
        assert_eq!(result, json!("Acme"));
    }

    #[test]
    fn test_array_indexing() {
        let ctx = json!({ "input_data": { "skus": ["A-1", "B-2", "C-3"] } });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("input_data.skus[0]", &ctx).unwrap(), json!("A-1"));
        assert_eq!(eval.evaluate_value("input_data.skus[2]", &ctx).unwrap(), json!("C-3"));
    }

    #[test]
    fn test_boolean_operators() {
        let ctx = json!({ "input_data": { "marketplace": "amazon", "region": "eu" } });
        let eval = evaluator();
        assert!(eval
            .evaluate_bool("input_data.marketplace == 'amazon' && input_data.region == 'eu'", &ctx)
            .unwrap());
        assert!(!eval
            .evaluate_bool("input_data.marketplace == 'amazon' && input_data.region == 'us'", &ctx)
            .unwrap());
        assert!(eval
            .evaluate_bool("input_data.region == 'us' || input_data.region == 'eu'", &ctx)
            .unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        let ctx = json!({ "steps": { "fetch": { "count": 12.0 } } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("steps.fetch.count > 10", &ctx).unwrap());
        assert!(!eval.evaluate_bool("steps.fetch.count < 10", &ctx).unwrap());
    }

    #[test]
    fn test_transform_chaining() {
        let ctx = json!({ "name": "  Hello World  " });
        let result = evaluator().evaluate_value("name|trim|lower", &ctx).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn test_transform_contains_array() {
        let ctx = json!({ "tags": ["sale", "new"] });
        let eval = evaluator();
        assert!(eval.evaluate_bool("tags|contains('sale')", &ctx).unwrap());
        assert!(!eval.evaluate_bool("tags|contains('clearance')", &ctx).unwrap());
    }

    #[test]
    fn test_transform_length() {
        let ctx = json!({ "items": ["a", "b", "c", "d"] });
        let eval = evaluator();
        assert!(eval.evaluate_bool("items|length > 3", &ctx).unwrap());
        assert!(!eval.evaluate_bool("items|length > 10", &ctx).unwrap());
    }

    #[test]
    fn test_transform_number() {
        let ctx = json!({ "price": "19.5" });
        assert!(evaluator().evaluate_bool("price|number > 19", &ctx).unwrap());
    }

    #[test]
    fn test_in_operator_array() {
        let ctx = json!({ "roles": ["admin", "user"] });
        let eval = evaluator();
        assert!(eval.evaluate_bool("'admin' in roles", &ctx).unwrap());
        assert!(!eval.evaluate_bool("'owner' in roles", &ctx).unwrap());
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let ctx = json!({ "input_data": {} });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("input_data.nothing", &ctx).unwrap(), json!(null));
        assert!(!eval.evaluate_bool("input_data.nothing", &ctx).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        assert!(evaluator().evaluate_bool("true", &json!("nope")).is_err());
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let ctx = json!({});
        assert!(matches!(
            evaluator().evaluate_bool("a ==", &ctx),
            Err(ExpressionError::EvalFailed(_))
        ));
    }

    #[test]
    fn test_value_contains_and_loose_equality() {
        assert!(value_contains(&json!("bulk order"), &json!("bulk")));
        assert!(value_contains(&json!([1, 2, 3]), &json!(2.0)));
        assert!(value_contains(&json!({"sku": 1}), &json!("sku")));
        assert!(!value_contains(&json!(42), &json!(4)));
        assert!(loosely_equal(&json!(5), &json!(5.0)));
    }
}
