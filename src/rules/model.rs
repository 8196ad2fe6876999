//! Alert rule definitions

use std::fmt;

use serde::{Deserialize, Serialize};

use super::condition::ConditionError;

/// Rule identifier as assigned by the rule repository
pub type RuleId = String;

/// Alert severity, ordered `Info < Warning < Critical`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Comparison of an observed value against a rule threshold.
///
/// Rules arrive from the repository with the operator as a string. Values
/// that do not name a supported comparison are kept as [`Operator::Unsupported`]
/// so evaluation can report them instead of quietly never firing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    /// `value > threshold`
    Gt,
    /// `value < threshold`
    Lt,
    /// `value >= threshold`
    Gte,
    /// `value <= threshold`
    Lte,
    /// `|value - threshold| < 0.001`
    Eq,
    /// Anything the evaluator does not understand
    Unsupported(String),
}

impl Operator {
    /// Parse an operator name, case-insensitively
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gt" | ">" | "greater_than" => Operator::Gt,
            "lt" | "<" | "less_than" => Operator::Lt,
            "gte" | ">=" | "greater_equal" => Operator::Gte,
            "lte" | "<=" | "less_equal" => Operator::Lte,
            "eq" | "==" | "equal" => Operator::Eq,
            _ => Operator::Unsupported(raw.to_string()),
        }
    }

    /// Canonical name, as stored by the rule repository
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Gt => "GT",
            Operator::Lt => "LT",
            Operator::Gte => "GTE",
            Operator::Lte => "LTE",
            Operator::Eq => "EQ",
            Operator::Unsupported(raw) => raw,
        }
    }

    /// Mathematical symbol used in alert messages
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Eq => "==",
            Operator::Unsupported(_) => "?",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Operator::Unsupported(_))
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        Operator::parse(&raw)
    }
}

impl From<&str> for Operator {
    fn from(raw: &str) -> Self {
        Operator::parse(raw)
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a rule that determine whether a value breaches it.
///
/// Firing state computed under one fingerprint is never carried over to
/// another: a changed metric stream, operator, threshold or hysteresis count
/// restarts the breach streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFingerprint {
    metric_key: String,
    operator: Operator,
    threshold_bits: Option<u64>,
    consecutive_breaches_required: u32,
}

/// Threshold alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule ID
    pub id: RuleId,
    /// Human-readable name
    pub name: String,
    /// Metric stream this rule watches
    pub metric_key: String,
    /// Comparison against the threshold
    pub operator: Operator,
    /// Threshold value; a rule without one never fires
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Severity copied onto alerts opened by this rule
    #[serde(default)]
    pub severity: Severity,
    /// Disabled rules are not evaluated at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Consecutive breaching samples needed before an alert opens
    #[serde(default = "default_consecutive_breaches")]
    pub consecutive_breaches_required: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_consecutive_breaches() -> u32 {
    1
}

impl AlertRule {
    /// Create an enabled rule with no threshold, WARNING severity and
    /// immediate triggering
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        metric_key: impl Into<String>,
        operator: impl Into<Operator>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metric_key: metric_key.into(),
            operator: operator.into(),
            threshold: None,
            severity: Severity::default(),
            enabled: true,
            consecutive_breaches_required: default_consecutive_breaches(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the hysteresis count
    pub fn with_consecutive_breaches(mut self, required: u32) -> Self {
        self.consecutive_breaches_required = required;
        self
    }

    /// Check the rule is structurally sound enough to evaluate
    pub fn validate(&self) -> Result<(), ConditionError> {
        if self.id.trim().is_empty() {
            return Err(ConditionError::InvalidRuleConfiguration(
                "rule id is empty".to_string(),
            ));
        }
        if self.metric_key.trim().is_empty() {
            return Err(ConditionError::InvalidRuleConfiguration(format!(
                "rule {} has no metric key",
                self.id
            )));
        }
        if let Operator::Unsupported(raw) = &self.operator {
            return Err(ConditionError::InvalidRuleConfiguration(format!(
                "rule {} uses unsupported operator '{}'",
                self.id, raw
            )));
        }
        if self.consecutive_breaches_required == 0 {
            return Err(ConditionError::InvalidRuleConfiguration(format!(
                "rule {} requires zero consecutive breaches",
                self.id
            )));
        }
        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() {
                return Err(ConditionError::InvalidRuleConfiguration(format!(
                    "rule {} has non-finite threshold {}",
                    self.id, threshold
                )));
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> RuleFingerprint {
        RuleFingerprint {
            metric_key: self.metric_key.clone(),
            operator: self.operator.clone(),
            threshold_bits: self.threshold.map(f64::to_bits),
            consecutive_breaches_required: self.consecutive_breaches_required,
        }
    }

    /// Render a message describing `value` against this rule
    pub fn describe(&self, value: f64) -> String {
        match self.threshold {
            Some(threshold) => format!(
                "{} = {} {} threshold {}",
                self.metric_key,
                value,
                self.operator.symbol(),
                threshold
            ),
            None => format!("{} = {} (no threshold)", self.metric_key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);

        let mut severities = vec![Severity::Critical, Severity::Info, Severity::Warning];
        severities.sort();
        assert_eq!(
            severities,
            vec![Severity::Info, Severity::Warning, Severity::Critical]
        );
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!(Operator::parse("GT"), Operator::Gt);
        assert_eq!(Operator::parse("gte"), Operator::Gte);
        assert_eq!(Operator::parse(" less_than "), Operator::Lt);
        assert_eq!(Operator::parse("<="), Operator::Lte);
        assert_eq!(Operator::parse("EQ"), Operator::Eq);
        assert_eq!(
            Operator::parse("BETWEEN"),
            Operator::Unsupported("BETWEEN".to_string())
        );
    }

    #[test]
    fn test_rule_deserialize() {
        let json = r#"{
            "id": "cpu-high",
            "name": "CPU high",
            "metric_key": "cpu.usage",
            "operator": "GT",
            "threshold": 90.0,
            "severity": "CRITICAL"
        }"#;

        let rule: AlertRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.operator, Operator::Gt);
        assert_eq!(rule.threshold, Some(90.0));
        assert_eq!(rule.severity, Severity::Critical);
        assert!(rule.enabled);
        assert_eq!(rule.consecutive_breaches_required, 1);

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["operator"], "GT");
    }

    #[test]
    fn test_unknown_operator_survives_deserialization() {
        let json = r#"{"id": "r", "name": "r", "metric_key": "m", "operator": "NE"}"#;
        let rule: AlertRule = serde_json::from_str(json).unwrap();

        assert_eq!(rule.operator, Operator::Unsupported("NE".to_string()));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_validate() {
        let rule = AlertRule::new("r1", "Rule", "cpu.usage", "GT").with_threshold(90.0);
        assert!(rule.validate().is_ok());

        // A missing threshold is valid; it just never fires
        let rule = AlertRule::new("r1", "Rule", "cpu.usage", "GT");
        assert!(rule.validate().is_ok());

        let rule = AlertRule::new("r1", "Rule", "", "GT").with_threshold(1.0);
        assert!(rule.validate().is_err());

        let rule = AlertRule::new("r1", "Rule", "cpu", "GT")
            .with_threshold(1.0)
            .with_consecutive_breaches(0);
        assert!(rule.validate().is_err());

        let rule = AlertRule::new("r1", "Rule", "cpu", "GT").with_threshold(f64::NAN);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_semantics_only() {
        let rule = AlertRule::new("r1", "Rule", "cpu", "GT").with_threshold(90.0);

        let renamed = AlertRule {
            name: "Renamed".to_string(),
            severity: Severity::Critical,
            ..rule.clone()
        };
        assert_eq!(rule.fingerprint(), renamed.fingerprint());

        let moved = rule.clone().with_threshold(80.0);
        assert_ne!(rule.fingerprint(), moved.fingerprint());

        let debounced = rule.clone().with_consecutive_breaches(3);
        assert_ne!(rule.fingerprint(), debounced.fingerprint());

        let restreamed = AlertRule {
            metric_key: "mem".to_string(),
            ..rule.clone()
        };
        assert_ne!(rule.fingerprint(), restreamed.fingerprint());
    }

    #[test]
    fn test_describe() {
        let rule = AlertRule::new("r1", "Rule", "cpu.usage", "GT").with_threshold(90.0);
        assert_eq!(rule.describe(95.0), "cpu.usage = 95 > threshold 90");
    }
}
