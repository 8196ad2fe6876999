//! Alert records and lifecycle events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::{AlertRule, Operator, RuleId, Severity};

/// Identifier of a persisted alert record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlertId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Whether an alert record is still open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// An alert record.
///
/// Rule attributes are copied at open time; later rule edits do not change
/// an alert that is already open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub metric_key: String,
    pub severity: Severity,
    pub operator: Operator,
    pub threshold: Option<f64>,
    /// Metric value that opened the alert
    pub trigger_value: f64,
    pub message: String,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Build a new open alert for `rule`, triggered by `value`
    pub fn open(rule: &AlertRule, value: f64, at: DateTime<Utc>) -> Self {
        Self {
            id: AlertId::generate(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            metric_key: rule.metric_key.clone(),
            severity: rule.severity,
            operator: rule.operator.clone(),
            threshold: rule.threshold,
            trigger_value: value,
            message: rule.describe(value),
            opened_at: at,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn status(&self) -> AlertStatus {
        if self.is_open() {
            AlertStatus::Active
        } else {
            AlertStatus::Resolved
        }
    }

    /// Mark resolved; a second call keeps the first resolution time
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(at);
        }
    }
}

/// Why an open alert was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveReason {
    /// The metric stopped breaching
    Recovered,
    /// The rule was disabled or deleted
    RuleRemoved,
    /// The rule's operator, threshold or hysteresis changed
    RuleChanged,
    /// Another open alert for the same rule was found in storage
    Superseded,
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveReason::Recovered => write!(f, "recovered"),
            ResolveReason::RuleRemoved => write!(f, "rule_removed"),
            ResolveReason::RuleChanged => write!(f, "rule_changed"),
            ResolveReason::Superseded => write!(f, "superseded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEventKind {
    Opened,
    Resolved,
}

impl fmt::Display for AlertEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertEventKind::Opened => write!(f, "ALERT_OPENED"),
            AlertEventKind::Resolved => write!(f, "ALERT_RESOLVED"),
        }
    }
}

/// Alert lifecycle event emitted by a firing-state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEvent {
    AlertOpened {
        alert: Alert,
    },
    AlertResolved {
        alert_id: AlertId,
        rule_id: RuleId,
        resolved_at: DateTime<Utc>,
        reason: ResolveReason,
    },
}

impl AlertEvent {
    pub fn kind(&self) -> AlertEventKind {
        match self {
            AlertEvent::AlertOpened { .. } => AlertEventKind::Opened,
            AlertEvent::AlertResolved { .. } => AlertEventKind::Resolved,
        }
    }

    pub fn rule_id(&self) -> &str {
        match self {
            AlertEvent::AlertOpened { alert } => &alert.rule_id,
            AlertEvent::AlertResolved { rule_id, .. } => rule_id,
        }
    }

    pub fn alert_id(&self) -> &AlertId {
        match self {
            AlertEvent::AlertOpened { alert } => &alert.id,
            AlertEvent::AlertResolved { alert_id, .. } => alert_id,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.kind() == AlertEventKind::Opened
    }

    pub fn is_resolved(&self) -> bool {
        self.kind() == AlertEventKind::Resolved
    }
}
