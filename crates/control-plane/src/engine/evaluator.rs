//! Condition evaluation for node triggers, joins and stages.
//!
//! Plain conditions compare one parameter with a literal; an optional
//! expression is rendered with minijinja. With no explicit condition,
//! propagation only continues when the upstream run succeeded.

use std::cmp::Ordering;

use regex::Regex;

use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::template::{ParameterScope, TemplateRenderer};
use crate::workflow::{ConditionOperator, Conditions, Parameter, PlainCondition};

/// Parameter carrying the propagated upstream status.
pub const STATUS_PARAMETER: &str = "cds.status";

/// Condition evaluator.
pub struct ConditionEvaluator {
    renderer: TemplateRenderer,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            renderer: TemplateRenderer::new(),
        }
    }

    /// Every plain condition holds and the expression, if any, is truthy.
    pub fn evaluate(&self, conditions: &Conditions, params: &[Parameter]) -> AppResult<bool> {
        let scope = ParameterScope::from_parameters(params);
        for condition in &conditions.plain {
            if !self.evaluate_plain(condition, &scope)? {
                return Ok(false);
            }
        }
        match conditions.expression.as_deref() {
            Some(expr) if !expr.trim().is_empty() => self.renderer.evaluate_condition(expr, &scope),
            _ => Ok(true),
        }
    }

    /// Conditions guarding automatic propagation to a node.
    ///
    /// Explicit conditions decide alone; otherwise the upstream run must
    /// have succeeded.
    pub fn should_propagate(&self, conditions: &Conditions, params: &[Parameter]) -> AppResult<bool> {
        if !conditions.is_empty() {
            return self.evaluate(conditions, params);
        }
        let status = params
            .iter()
            .find(|p| p.name == STATUS_PARAMETER)
            .map(|p| p.value.as_str());
        Ok(status == Some(Status::Success.as_str()))
    }

    fn evaluate_plain(&self, condition: &PlainCondition, scope: &ParameterScope) -> AppResult<bool> {
        let actual = scope.get(&condition.variable).unwrap_or_default();
        let expected = condition.value.as_str();
        let result = match condition.operator {
            ConditionOperator::Eq => actual == expected,
            ConditionOperator::Ne => actual != expected,
            ConditionOperator::Lt => compare(actual, expected) == Ordering::Less,
            ConditionOperator::Le => compare(actual, expected) != Ordering::Greater,
            ConditionOperator::Gt => compare(actual, expected) == Ordering::Greater,
            ConditionOperator::Ge => compare(actual, expected) != Ordering::Less,
            ConditionOperator::Regex => Regex::new(expected)
                .map_err(|e| {
                    AppError::Validation(format!(
                        "invalid regex for {}: {}",
                        condition.variable, e
                    ))
                })?
                .is_match(actual),
        };
        Ok(result)
    }
}

/// Numeric when both sides parse, lexicographic otherwise.
fn compare(actual: &str, expected: &str) -> Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(status: &str) -> Vec<Parameter> {
        vec![
            Parameter::new(STATUS_PARAMETER, status),
            Parameter::new("git.branch", "release/2.1"),
            Parameter::new("cds.run.number", "12"),
        ]
    }

    #[test]
    fn test_default_policy_requires_success() {
        let evaluator = ConditionEvaluator::new();
        let none = Conditions::default();
        assert!(evaluator.should_propagate(&none, &params("Success")).unwrap());
        assert!(!evaluator.should_propagate(&none, &params("Fail")).unwrap());
        assert!(!evaluator.should_propagate(&none, &params("Stopped")).unwrap());
        assert!(!evaluator.should_propagate(&none, &[]).unwrap());
    }

    #[test]
    fn test_explicit_condition_overrides_default() {
        let evaluator = ConditionEvaluator::new();
        let on_failure = Conditions {
            plain: vec![PlainCondition::new(STATUS_PARAMETER, ConditionOperator::Eq, "Fail")],
            expression: None,
        };
        assert!(evaluator.should_propagate(&on_failure, &params("Fail")).unwrap());
        assert!(!evaluator.should_propagate(&on_failure, &params("Success")).unwrap());
    }

    #[test]
    fn test_plain_operators() {
        let evaluator = ConditionEvaluator::new();
        let check = |variable: &str, operator, value: &str| {
            let conditions = Conditions {
                plain: vec![PlainCondition::new(variable, operator, value)],
                expression: None,
            };
            evaluator.evaluate(&conditions, &params("Success")).unwrap()
        };
        assert!(check("cds.run.number", ConditionOperator::Gt, "9"));
        assert!(check("cds.run.number", ConditionOperator::Le, "12"));
        assert!(!check("cds.run.number", ConditionOperator::Lt, "2"));
        assert!(check("git.branch", ConditionOperator::Regex, "^release/"));
        assert!(check("git.branch", ConditionOperator::Ne, "main"));
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let evaluator = ConditionEvaluator::new();
        let conditions = Conditions {
            plain: vec![PlainCondition::new("git.branch", ConditionOperator::Regex, "(")],
            expression: None,
        };
        assert!(evaluator.evaluate(&conditions, &params("Success")).is_err());
    }

    #[test]
    fn test_expression_condition() {
        let evaluator = ConditionEvaluator::new();
        let conditions = Conditions {
            plain: Vec::new(),
            expression: Some("'release' in git.branch and cds.status == 'Success'".into()),
        };
        assert!(evaluator.evaluate(&conditions, &params("Success")).unwrap());
        assert!(!evaluator.evaluate(&conditions, &params("Fail")).unwrap());
    }
}
