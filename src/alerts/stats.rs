//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::model::AlertEvent;

/// Lock-free counters updated on the evaluation path
#[derive(Debug, Default)]
pub struct EngineStats {
    samples: AtomicU64,
    nan_samples: AtomicU64,
    rule_evaluations: AtomicU64,
    invalid_rule_evaluations: AtomicU64,
    alerts_opened: AtomicU64,
    alerts_resolved: AtomicU64,
    sink_failures: AtomicU64,
    retried_deliveries: AtomicU64,
    collapsed_deliveries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nan_sample(&self) {
        self.nan_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self) {
        self.rule_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_rule(&self) {
        self.invalid_rule_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self, event: &AlertEvent) {
        let counter = match event {
            AlertEvent::AlertOpened { .. } => &self.alerts_opened,
            AlertEvent::AlertResolved { .. } => &self.alerts_resolved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried_delivery(&self) {
        self.retried_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collapsed_delivery(&self) {
        self.collapsed_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            nan_samples: self.nan_samples.load(Ordering::Relaxed),
            rule_evaluations: self.rule_evaluations.load(Ordering::Relaxed),
            invalid_rule_evaluations: self.invalid_rule_evaluations.load(Ordering::Relaxed),
            alerts_opened: self.alerts_opened.load(Ordering::Relaxed),
            alerts_resolved: self.alerts_resolved.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            retried_deliveries: self.retried_deliveries.load(Ordering::Relaxed),
            collapsed_deliveries: self.collapsed_deliveries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub samples: u64,
    pub nan_samples: u64,
    pub rule_evaluations: u64,
    pub invalid_rule_evaluations: u64,
    pub alerts_opened: u64,
    pub alerts_resolved: u64,
    pub sink_failures: u64,
    /// Deliveries that succeeded on a retry
    pub retried_deliveries: u64,
    /// Unsent open/resolve pairs dropped from a backlog
    pub collapsed_deliveries: u64,
    pub dead_lettered: u64,
}
