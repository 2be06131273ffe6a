//! Step precondition evaluation.
//!
//! A step without a condition always runs. Evaluation failures are logged and
//! treated as "do not run" so a malformed condition skips the step instead of
//! failing the execution.

use serde_json::Value;
use tradeflow_types::workflow::{CompareOperator, StepCondition};

use super::context::ExecutionContext;
use super::expression::{ExpressionError, ExpressionEvaluator, loosely_equal, value_contains};

/// Evaluator for [`StepCondition`]s. Holds one JEXL evaluator for the
/// lifetime of the step runner.
#[derive(Default)]
pub struct ConditionEvaluator {
    expressions: ExpressionEvaluator,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a step should run against the current context.
    pub fn should_run(&self, condition: Option<&StepCondition>, context: &ExecutionContext) -> bool {
        let Some(condition) = condition else {
            return true;
        };
        match self.evaluate(condition, context) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(error = %e, ?condition, "condition evaluation failed, treating as false");
                false
            }
        }
    }

    /// Evaluate a condition, surfacing evaluation errors.
    pub fn evaluate(&self, condition: &StepCondition, context: &ExecutionContext) -> Result<bool, ExpressionError> {
        match condition {
            StepCondition::Expression { expression } => {
                self.expressions.evaluate_bool(expression, &context.to_value())
            }
            StepCondition::ValueCheck { path, operator, value } => {
                let actual = context.get_path(path).unwrap_or(&Value::Null);
                compare(actual, *operator, value)
            }
        }
    }
}

fn compare(actual: &Value, operator: CompareOperator, expected: &Value) -> Result<bool, ExpressionError> {
    Ok(match operator {
        CompareOperator::Equals => loosely_equal(actual, expected),
        CompareOperator::NotEquals => !loosely_equal(actual, expected),
        CompareOperator::GreaterThan => {
            let (a, b) = numeric(actual, expected)?;
            a > b
        }
        CompareOperator::LessThan => {
            let (a, b) = numeric(actual, expected)?;
            a < b
        }
        CompareOperator::Contains => value_contains(actual, expected),
        CompareOperator::NotContains => !value_contains(actual, expected),
    })
}

fn numeric(actual: &Value, expected: &Value) -> Result<(f64, f64), ExpressionError> {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExpressionError::EvalFailed(format!(
            "cannot compare {actual} with {expected} numerically"
        ))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            json!({"marketplace": "amazon", "count": 7, "tags": ["sale"], "price": "12.50"}),
        )
    }

    fn check(path: &str, operator: CompareOperator, value: Value) -> StepCondition {
        StepCondition::ValueCheck {
            path: path.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn no_condition_runs() {
        assert!(ConditionEvaluator::new().should_run(None, &context()));
    }

    #[test]
    fn value_check_operators() {
        let ctx = context();
        let eval = ConditionEvaluator::new();
        let cases = [
            (check("input_data.marketplace", CompareOperator::Equals, json!("amazon")), true),
            (check("input_data.marketplace", CompareOperator::NotEquals, json!("ebay")), true),
            (check("input_data.count", CompareOperator::GreaterThan, json!(5)), true),
            (check("input_data.count", CompareOperator::LessThan, json!(5)), false),
            (check("input_data.price", CompareOperator::GreaterThan, json!(12)), true),
            (check("input_data.tags", CompareOperator::Contains, json!("sale")), true),
            (check("input_data.tags", CompareOperator::NotContains, json!("sale")), false),
            (check("input_data.count", CompareOperator::Equals, json!(7.0)), true),
        ];
        for (cond, expected) in cases {
            assert_eq!(eval.should_run(Some(&cond), &ctx), expected, "{cond:?}");
        }
    }

    #[test]
    fn missing_path_compares_as_null() {
        let eval = ConditionEvaluator::new();
        let cond = check("input_data.absent", CompareOperator::Equals, Value::Null);
        assert!(eval.should_run(Some(&cond), &context()));
    }

    #[test]
    fn non_numeric_comparison_is_false() {
        let eval = ConditionEvaluator::new();
        let cond = check("input_data.marketplace", CompareOperator::GreaterThan, json!(1));
        assert!(eval.evaluate(&cond, &context()).is_err());
        assert!(!eval.should_run(Some(&cond), &context()));
    }

    #[test]
    fn expression_condition() {
        let eval = ConditionEvaluator::new();
        let ctx = context();
        let yes = StepCondition::Expression {
            expression: "input_data.marketplace == 'amazon' && input_data.count > 3".to_string(),
        };
        let no = StepCondition::Expression {
            expression: "input_data.marketplace == 'ebay'".to_string(),
        };
        assert!(eval.should_run(Some(&yes), &ctx));
        assert!(!eval.should_run(Some(&no), &ctx));
    }

    #[test]
    fn broken_expression_is_false() {
        let cond = StepCondition::Expression {
            expression: "input_data.marketplace ==".to_string(),
        };
        assert!(!ConditionEvaluator::new().should_run(Some(&cond), &context()));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let eval = ConditionEvaluator::new();
        let ctx = context();
        let cond = StepCondition::Expression {
            expression: "input_data.tags|length > 0".to_string(),
        };
        let first = eval.should_run(Some(&cond), &ctx);
        for _ in 0..10 {
            assert_eq!(eval.should_run(Some(&cond), &ctx), first);
        }
    }

    #[test]
    fn one_evaluator_keeps_transforms_after_a_failure() {
        fn shared<T: Send + Sync>(_: &T) {}
        let eval = ConditionEvaluator::new();
        shared(&eval);
        let ctx = context();
        let broken = StepCondition::Expression {
            expression: "input_data.tags ==".to_string(),
        };
        let tagged = StepCondition::Expression {
            expression: "input_data.tags|contains('sale')".to_string(),
        };
        assert!(!eval.should_run(Some(&broken), &ctx));
        assert!(eval.should_run(Some(&tagged), &ctx));
        assert!(eval.should_run(Some(&tagged), &ctx));
    }
}
