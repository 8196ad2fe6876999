//! Per-rule firing state machine
//!
//! ```text
//!            breach (count < required)
//!   CLEAR ───────────────────────────▶ PENDING ──┐ breach (count < required)
//!     ▲ ▲                                │  ▲     │
//!     │ └──────── no breach ─────────────┘  └─────┘
//!     │                                  │
//!     │ no breach           breach (count >= required)
//!     │                                  ▼
//!     └──────────────────────────────── OPEN ◀──┐ breach
//!                                          └────┘
//! ```
//!
//! `CLEAR` jumps straight to `OPEN` when a rule needs a single breach. Every
//! `(state, breached)` pair has exactly one successor and emits at most one
//! event.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::model::{Alert, AlertEvent, AlertId, ResolveReason};
use crate::rules::{AlertRule, RuleFingerprint, RuleId};

/// Externally visible firing status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FiringStatus {
    #[default]
    Clear,
    Pending,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Clear,
    Pending { breaches: u32 },
    Open { alert_id: AlertId, breaches: u32 },
}

/// Firing state of a single rule
#[derive(Debug, Clone, PartialEq)]
pub struct AlertState {
    rule_id: RuleId,
    phase: Phase,
    /// Rule semantics the current streak was counted under
    fingerprint: Option<RuleFingerprint>,
    last_sample_at: Option<DateTime<Utc>>,
}

impl AlertState {
    pub fn new(rule_id: impl Into<RuleId>) -> Self {
        Self {
            rule_id: rule_id.into(),
            phase: Phase::Clear,
            fingerprint: None,
            last_sample_at: None,
        }
    }

    /// State rebuilt from an alert found open in durable storage.
    ///
    /// The rule semantics the alert was opened under are unknown, so the
    /// first evaluation adopts whatever the rule is now.
    pub fn recovered(rule_id: impl Into<RuleId>, alert_id: AlertId) -> Self {
        Self {
            rule_id: rule_id.into(),
            phase: Phase::Open {
                alert_id,
                breaches: 0,
            },
            fingerprint: None,
            last_sample_at: None,
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn status(&self) -> FiringStatus {
        match self.phase {
            Phase::Clear => FiringStatus::Clear,
            Phase::Pending { .. } => FiringStatus::Pending,
            Phase::Open { .. } => FiringStatus::Open,
        }
    }

    pub fn consecutive_breaches(&self) -> u32 {
        match self.phase {
            Phase::Clear => 0,
            Phase::Pending { breaches } | Phase::Open { breaches, .. } => breaches,
        }
    }

    /// Present only while OPEN
    pub fn open_alert_id(&self) -> Option<&AlertId> {
        match &self.phase {
            Phase::Open { alert_id, .. } => Some(alert_id),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open { .. })
    }

    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_sample_at
    }

    /// Apply one breach decision for `rule`.
    ///
    /// Call [`AlertState::sync_rule`] first so a changed rule restarts its
    /// streak before this sample is counted.
    pub fn transition(
        &mut self,
        rule: &AlertRule,
        breached: bool,
        value: f64,
        at: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(rule.fingerprint());
        }
        self.last_sample_at = Some(at);

        let phase = std::mem::replace(&mut self.phase, Phase::Clear);
        let (next, event) = match (phase, breached) {
            (Phase::Clear, false) => (Phase::Clear, None),
            (Phase::Clear, true) => count_breach(0, rule, value, at),
            (Phase::Pending { breaches }, true) => count_breach(breaches, rule, value, at),
            // A broken streak starts over
            (Phase::Pending { .. }, false) => (Phase::Clear, None),
            (Phase::Open { alert_id, breaches }, true) => (
                Phase::Open {
                    alert_id,
                    breaches: breaches.saturating_add(1),
                },
                None,
            ),
            (Phase::Open { alert_id, .. }, false) => (
                Phase::Clear,
                Some(self.resolved(alert_id, ResolveReason::Recovered, at)),
            ),
        };

        self.phase = next;
        event
    }

    /// Return to CLEAR, resolving the open alert if there is one
    pub fn force_resolve(&mut self, reason: ResolveReason, at: DateTime<Utc>) -> Option<AlertEvent> {
        match std::mem::replace(&mut self.phase, Phase::Clear) {
            Phase::Open { alert_id, .. } => Some(self.resolved(alert_id, reason, at)),
            Phase::Pending { .. } | Phase::Clear => None,
        }
    }

    /// Adopt `rule`'s current semantics.
    ///
    /// If the metric key, operator, threshold or hysteresis count changed since the
    /// streak started, the state restarts from CLEAR and an open alert is
    /// resolved with [`ResolveReason::RuleChanged`].
    pub fn sync_rule(&mut self, rule: &AlertRule, at: DateTime<Utc>) -> Option<AlertEvent> {
        let fingerprint = rule.fingerprint();
        match &self.fingerprint {
            Some(current) if *current == fingerprint => None,
            Some(_) => {
                self.fingerprint = Some(fingerprint);
                self.force_resolve(ResolveReason::RuleChanged, at)
            }
            None => {
                self.fingerprint = Some(fingerprint);
                None
            }
        }
    }

    /// Restart the breach streak after an explicit rule change notification.
    ///
    /// A PENDING streak is always dropped. An OPEN alert survives only if
    /// the rule's semantics are unchanged.
    pub fn reset_hysteresis(&mut self, rule: &AlertRule, at: DateTime<Utc>) -> Option<AlertEvent> {
        let event = self.sync_rule(rule, at);
        if let Phase::Pending { .. } = self.phase {
            self.phase = Phase::Clear;
        }
        event
    }

    fn resolved(&self, alert_id: AlertId, reason: ResolveReason, at: DateTime<Utc>) -> AlertEvent {
        AlertEvent::AlertResolved {
            alert_id,
            rule_id: self.rule_id.clone(),
            resolved_at: at,
            reason,
        }
    }
}

fn count_breach(
    previous: u32,
    rule: &AlertRule,
    value: f64,
    at: DateTime<Utc>,
) -> (Phase, Option<AlertEvent>) {
    let breaches = previous.saturating_add(1);
    if breaches >= rule.consecutive_breaches_required.max(1) {
        let alert = Alert::open(rule, value, at);
        (
            Phase::Open {
                alert_id: alert.id.clone(),
                breaches,
            },
            Some(AlertEvent::AlertOpened { alert }),
        )
    } else {
        (Phase::Pending { breaches }, None)
    }
}
