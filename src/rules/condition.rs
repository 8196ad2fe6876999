//! Threshold comparison

use super::model::{AlertRule, Operator};

/// Tolerance used by the `EQ` operator
pub const EQ_TOLERANCE: f64 = 0.001;

/// Stateless evaluator for a rule's comparison
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Decide whether `value` breaches `threshold` under `operator`.
    ///
    /// A missing threshold never breaches, whatever the operator. A `NaN`
    /// value never breaches either; callers are expected to report it.
    pub fn evaluate(
        operator: &Operator,
        threshold: Option<f64>,
        value: f64,
    ) -> Result<bool, ConditionError> {
        let Some(threshold) = threshold else {
            return Ok(false);
        };

        if threshold.is_nan() {
            return Err(ConditionError::InvalidRuleConfiguration(
                "threshold is NaN".to_string(),
            ));
        }

        if value.is_nan() {
            return Ok(false);
        }

        match operator {
            Operator::Gt => Ok(value > threshold),
            Operator::Lt => Ok(value < threshold),
            Operator::Gte => Ok(value >= threshold),
            Operator::Lte => Ok(value <= threshold),
            Operator::Eq => Ok((value - threshold).abs() < EQ_TOLERANCE),
            Operator::Unsupported(raw) => Err(ConditionError::InvalidRuleConfiguration(
                format!("unsupported operator '{}'", raw),
            )),
        }
    }

    /// Evaluate a rule's own operator and threshold
    pub fn evaluate_rule(rule: &AlertRule, value: f64) -> Result<bool, ConditionError> {
        Self::evaluate(&rule.operator, rule.threshold, value)
    }
}

/// Rule evaluation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Invalid rule configuration: {0}")]
    InvalidRuleConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUES: &[f64] = &[
        f64::NEG_INFINITY,
        -1e9,
        -10.0,
        -0.5,
        0.0,
        0.0005,
        9.999,
        10.0,
        10.0005,
        10.5,
        90.0,
        1e12,
        f64::INFINITY,
    ];

    const THRESHOLDS: &[f64] = &[-10.0, 0.0, 10.0, 90.0];

    #[test]
    fn test_operators_match_float_comparison() {
        for &t in THRESHOLDS {
            for &v in VALUES {
                let eval = |op: Operator| ConditionEvaluator::evaluate(&op, Some(t), v).unwrap();
                assert_eq!(eval(Operator::Gt), v > t, "GT {} {}", v, t);
                assert_eq!(eval(Operator::Lt), v < t, "LT {} {}", v, t);
                assert_eq!(eval(Operator::Gte), v >= t, "GTE {} {}", v, t);
                assert_eq!(eval(Operator::Lte), v <= t, "LTE {} {}", v, t);
            }
        }
    }

    #[test]
    fn test_missing_threshold_never_breaches() {
        let operators = [
            Operator::Gt,
            Operator::Lt,
            Operator::Gte,
            Operator::Lte,
            Operator::Eq,
            Operator::Unsupported("BOGUS".to_string()),
        ];

        for op in &operators {
            for &v in VALUES {
                assert_eq!(ConditionEvaluator::evaluate(op, None, v), Ok(false));
            }
        }
    }

    #[test]
    fn test_nan_value_never_breaches() {
        for op in [Operator::Gt, Operator::Lt, Operator::Gte, Operator::Lte, Operator::Eq] {
            assert_eq!(
                ConditionEvaluator::evaluate(&op, Some(0.0), f64::NAN),
                Ok(false)
            );
        }
    }

    #[test]
    fn test_eq_uses_tolerance() {
        let eq = |v| ConditionEvaluator::evaluate(&Operator::Eq, Some(10.0), v).unwrap();
        assert!(eq(10.0));
        assert!(eq(10.0005));
        assert!(eq(9.9995));
        assert!(!eq(10.002));
        assert!(!eq(9.99));
    }

    #[test]
    fn test_unsupported_operator_is_an_error() {
        let result =
            ConditionEvaluator::evaluate(&Operator::Unsupported("NE".to_string()), Some(1.0), 2.0);
        assert!(matches!(
            result,
            Err(ConditionError::InvalidRuleConfiguration(_))
        ));
    }

    #[test]
    fn test_nan_threshold_is_an_error() {
        let result = ConditionEvaluator::evaluate(&Operator::Gt, Some(f64::NAN), 2.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_evaluate_rule() {
        let rule = AlertRule::new("r1", "Rule", "cpu", "LTE").with_threshold(10.0);
        assert_eq!(ConditionEvaluator::evaluate_rule(&rule, 5.0), Ok(true));
        assert_eq!(ConditionEvaluator::evaluate_rule(&rule, 20.0), Ok(false));
    }
}
