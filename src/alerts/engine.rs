//! Per-sample evaluation cycle
//!
//! For each sample the engine looks up the enabled rules watching its metric
//! key and, per rule, takes that rule's slot lock, evaluates the threshold,
//! applies the firing-state transition and hands any resulting event to the
//! alert sink. Rules are processed concurrently; a rule's own samples are
//! serialized by its slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::delivery::{deliver, enqueue, DeadLetterLog, Enqueued, PendingDelivery, RetryPolicy};
use super::model::{AlertEvent, ResolveReason};
use super::sink::{AlertRepository, SinkError};
use super::stats::{EngineStats, StatsSnapshot};
use super::tracker::{AlertStateTracker, RuleSlot};
use crate::config::EngineConfig;
use crate::ingest::MetricSample;
use crate::rules::{
    AlertRuleRepository, AlertRuleStore, ConditionEvaluator, RuleSnapshot, RuleStoreError,
    StoreHealth,
};

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Rule store error: {0}")]
    RuleStore(#[from] RuleStoreError),

    #[error("Alert repository error: {0}")]
    AlertRepository(#[from] SinkError),
}

/// Outcome of [`AlertTriggerEngine::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Rules seeded as OPEN from storage
    pub seeded: usize,
    /// Open alerts whose rule is no longer enabled
    pub orphaned: usize,
    /// Extra open alerts for a rule that already had one
    pub superseded: usize,
}

/// Outcome of one [`AlertTriggerEngine::retry_pending`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dead_lettered: usize,
    /// Events still waiting after this pass
    pub still_pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub store: StoreHealth,
    pub tracked_rules: usize,
    pub pending_rules: usize,
    pub open_alerts: usize,
    pub pending_deliveries: usize,
    pub dead_letters: usize,
    pub stats: StatsSnapshot,
}

pub struct AlertTriggerEngine {
    store: AlertRuleStore,
    tracker: AlertStateTracker,
    alerts: Arc<dyn AlertRepository>,
    retry_policy: RetryPolicy,
    sink_timeout: Duration,
    dead_letters: DeadLetterLog,
    stats: EngineStats,
    /// Newest snapshot generation tracked state was reconciled against
    reconciled_generation: AtomicU64,
}

impl AlertTriggerEngine {
    pub fn new(
        config: &EngineConfig,
        rules: Arc<dyn AlertRuleRepository>,
        alerts: Arc<dyn AlertRepository>,
    ) -> Self {
        Self {
            store: AlertRuleStore::new(rules, config.max_staleness()),
            tracker: AlertStateTracker::new(),
            alerts,
            retry_policy: config.retry_policy(),
            sink_timeout: config.sink_timeout(),
            dead_letters: DeadLetterLog::new(),
            stats: EngineStats::new(),
            reconciled_generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &AlertRuleStore {
        &self.store
    }

    pub fn tracker(&self) -> &AlertStateTracker {
        &self.tracker
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    /// Evaluate one sample against every enabled rule for `metric_key`.
    ///
    /// Returns the events produced by the resulting transitions, whether or
    /// not their delivery has succeeded yet.
    pub async fn on_metric_sample(
        &self,
        metric_key: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        self.stats.record_sample();
        if value.is_nan() {
            self.stats.record_nan_sample();
            warn!(metric_key, "NaN sample value, treating as no breach");
        }

        let snapshot = self.store.snapshot().await;
        let mut events = self.reconcile_if_newer(&snapshot).await;

        let rules = snapshot.rules_for(metric_key);
        if rules.is_empty() {
            debug!(metric_key, "No rules for metric");
            return events;
        }

        let evaluations = rules
            .iter()
            .map(|rule| self.evaluate_rule(&rule.id, metric_key, value, timestamp));
        events.extend(join_all(evaluations).await.into_iter().flatten());
        events
    }

    pub async fn on_sample(&self, sample: &MetricSample) -> Vec<AlertEvent> {
        self.on_metric_sample(&sample.metric_key, sample.value, sample.timestamp)
            .await
    }

    async fn evaluate_rule(
        &self,
        rule_id: &str,
        metric_key: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        let mut slot = self.tracker.lock(rule_id).await;

        // Re-read under the lock: the rule may have changed since lookup
        let current = self.store.current();
        let rule = match current.get(rule_id) {
            Some(rule) if rule.metric_key == metric_key => Arc::clone(rule),
            _ => {
                debug!(rule_id, metric_key, "Rule no longer watches metric, skipping");
                if !slot.state.is_open() {
                    slot.retire();
                    self.tracker.release(slot);
                }
                return Vec::new();
            }
        };

        let breached = match rule
            .validate()
            .and_then(|_| ConditionEvaluator::evaluate_rule(&rule, value))
        {
            Ok(breached) => breached,
            Err(e) => {
                self.stats.record_invalid_rule();
                warn!(rule_id, error = %e, "Skipping invalid rule");
                return Vec::new();
            }
        };
        self.stats.record_evaluation();

        if let Some(last) = slot.state.last_sample_at() {
            if timestamp < last {
                debug!(
                    rule_id,
                    timestamp = %timestamp,
                    last = %last,
                    "Sample older than previous one, applying in arrival order"
                );
            }
        }

        let mut events = Vec::new();
        events.extend(slot.state.sync_rule(&rule, timestamp));
        events.extend(slot.state.transition(&rule, breached, value, timestamp));

        for event in &events {
            self.dispatch(&mut slot, event.clone()).await;
        }
        events
    }

    /// Invalidate the rule snapshot after `rule_id` was edited, then restart
    /// that rule's breach streak.
    ///
    /// A rule that is gone from the refreshed enabled set has its open
    /// alert resolved and its state dropped.
    pub async fn on_rule_changed(&self, rule_id: &str) -> Result<Vec<AlertEvent>, EngineError> {
        info!(rule_id, "Rule changed, refreshing rules");
        self.store.invalidate();

        let snapshot = match self.store.refresh().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Keep the change pending for the next read, but drop the
                // streak now: it was counted under the old rule
                self.store.invalidate();
                self.reconcile_rule(rule_id, true).await;
                return Err(e.into());
            }
        };

        let mut events = self.reconcile_if_newer(&snapshot).await;
        events.extend(self.reconcile_rule(rule_id, true).await);
        Ok(events)
    }

    /// Re-fetch rules now and reconcile tracked state with the result
    pub async fn refresh_rules(&self) -> Result<Vec<AlertEvent>, EngineError> {
        let snapshot = self.store.refresh().await?;
        Ok(self.reconcile_if_newer(&snapshot).await)
    }

    async fn reconcile_if_newer(&self, snapshot: &RuleSnapshot) -> Vec<AlertEvent> {
        let generation = snapshot.generation();
        let claimed = self
            .reconciled_generation
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seen| {
                (generation > seen).then_some(generation)
            })
            .is_ok();
        if !claimed {
            return Vec::new();
        }

        let rule_ids = self.tracker.rule_ids();
        debug!(generation, tracked = rule_ids.len(), "Reconciling rule state");
        let work = rule_ids
            .iter()
            .map(|rule_id| self.reconcile_rule(rule_id, false));
        join_all(work).await.into_iter().flatten().collect()
    }

    /// Bring one tracked rule in line with the current snapshot
    async fn reconcile_rule(&self, rule_id: &str, reset_hysteresis: bool) -> Vec<AlertEvent> {
        let Some(mut slot) = self.tracker.lock_existing(rule_id).await else {
            return Vec::new();
        };

        let now = Utc::now();
        let current = self.store.current();
        let event = match current.get(rule_id) {
            Some(rule) if reset_hysteresis => slot.state.reset_hysteresis(rule, now),
            Some(rule) => slot.state.sync_rule(rule, now),
            None => {
                let event = slot.state.force_resolve(ResolveReason::RuleRemoved, now);
                slot.retire();
                event
            }
        };

        if let Some(event) = &event {
            self.dispatch(&mut slot, event.clone()).await;
        }
        if slot.is_retired() {
            self.tracker.release(slot);
        }
        event.into_iter().collect()
    }

    /// Rebuild firing state from alerts left open in durable storage.
    ///
    /// Every enabled rule with an open alert is seeded as OPEN, so its next
    /// breach does not open a duplicate. Open alerts for rules that are no
    /// longer enabled, and all but the newest open alert of a rule, are
    /// resolved. Needs a successful rule load: recovering against an empty
    /// rule set would resolve every stored alert.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let snapshot = self.store.refresh().await?;
        self.reconciled_generation
            .fetch_max(snapshot.generation(), Ordering::AcqRel);

        let lookups = snapshot.rules().map(|rule| async move {
            let found = self.alerts.find_open_by_rule_id(&rule.id).await;
            (rule.id.as_str(), found)
        });

        let mut report = RecoveryReport::default();
        for (rule_id, found) in join_all(lookups).await {
            if let Some(alert) = found? {
                if self.tracker.seed_open(rule_id, alert.id.clone()).await {
                    info!(rule_id, alert_id = %alert.id, "Recovered open alert");
                    report.seeded += 1;
                }
            }
        }

        for alert in self.alerts.find_all_open().await? {
            let tracked = self
                .tracker
                .state(&alert.rule_id)
                .await
                .and_then(|s| s.open_alert_id().cloned());
            if tracked.as_ref() == Some(&alert.id) {
                continue;
            }

            let reason = if snapshot.contains(&alert.rule_id) {
                report.superseded += 1;
                ResolveReason::Superseded
            } else {
                report.orphaned += 1;
                ResolveReason::RuleRemoved
            };
            warn!(
                rule_id = %alert.rule_id,
                alert_id = %alert.id,
                reason = %reason,
                "Resolving stray open alert found during recovery"
            );

            let event = AlertEvent::AlertResolved {
                alert_id: alert.id,
                rule_id: alert.rule_id.clone(),
                resolved_at: Utc::now(),
                reason,
            };
            let mut slot = self.tracker.lock(&alert.rule_id).await;
            self.dispatch(&mut slot, event).await;
            if reason == ResolveReason::RuleRemoved {
                slot.retire();
                self.tracker.release(slot);
            }
        }

        info!(
            seeded = report.seeded,
            orphaned = report.orphaned,
            superseded = report.superseded,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Send or queue one event. Must be called with the rule's slot held.
    async fn dispatch(&self, slot: &mut RuleSlot, event: AlertEvent) {
        self.stats.record_event(&event);
        match &event {
            AlertEvent::AlertOpened { alert } => info!(
                rule_id = %alert.rule_id,
                alert_id = %alert.id,
                severity = %alert.severity,
                value = alert.trigger_value,
                "Alert opened: {}",
                alert.message
            ),
            AlertEvent::AlertResolved {
                rule_id,
                alert_id,
                reason,
                ..
            } => info!(rule_id = %rule_id, alert_id = %alert_id, reason = %reason, "Alert resolved"),
        }

        let rule_id = event.rule_id().to_string();
        if !slot.outbox.is_empty() {
            match enqueue(&mut slot.outbox, event) {
                Enqueued::Queued => {
                    debug!(rule_id = %rule_id, backlog = slot.outbox.len(), "Queued behind undelivered events");
                }
                Enqueued::Collapsed(opened) => {
                    self.stats.record_collapsed_delivery();
                    warn!(
                        rule_id = %rule_id,
                        alert_id = %opened.alert_id(),
                        "Alert opened and resolved while undelivered, dropping both events"
                    );
                }
                Enqueued::Overflow(event) => {
                    let error = SinkError::BacklogFull(slot.outbox.len());
                    self.dead_letter(event, 0, &error);
                }
            }
            self.tracker.mark_backlogged(&rule_id);
            return;
        }

        if let Err(error) = deliver(self.alerts.as_ref(), &event, self.sink_timeout).await {
            self.stats.record_sink_failure();
            if error.is_retryable() && !self.retry_policy.exhausted(1) {
                warn!(
                    rule_id = %rule_id,
                    alert_id = %event.alert_id(),
                    kind = %event.kind(),
                    error = %error,
                    "Alert delivery failed, will retry"
                );
                slot.outbox
                    .push_back(PendingDelivery::failed(event, error, &self.retry_policy));
                self.tracker.mark_backlogged(&rule_id);
            } else {
                self.dead_letter(event, 1, &error);
            }
        }
    }

    /// Retry every due event in every backlogged outbox
    pub async fn retry_pending(&self) -> RetryReport {
        let mut report = RetryReport::default();

        for rule_id in self.tracker.backlogged() {
            let Some(mut slot) = self.tracker.lock_existing(&rule_id).await else {
                self.tracker.unmark_backlogged(&rule_id);
                continue;
            };

            self.drain_outbox(&mut slot, &mut report).await;

            if slot.outbox.is_empty() {
                self.tracker.unmark_backlogged(&rule_id);
                self.tracker.release(slot);
            } else {
                report.still_pending += slot.outbox.len();
            }
        }

        if report.attempted > 0 {
            debug!(
                attempted = report.attempted,
                delivered = report.delivered,
                dead_lettered = report.dead_lettered,
                still_pending = report.still_pending,
                "Retry pass complete"
            );
        }
        report
    }

    /// Deliver due events front to back, stopping at the first one that has
    /// to wait.
    async fn drain_outbox(&self, slot: &mut RuleSlot, report: &mut RetryReport) {
        let now = Instant::now();

        while let Some(front) = slot.outbox.front() {
            if !front.is_due(now) {
                break;
            }
            let event = front.event.clone();
            report.attempted += 1;

            match deliver(self.alerts.as_ref(), &event, self.sink_timeout).await {
                Ok(()) => {
                    if let Some(delivered) = slot.outbox.pop_front() {
                        if delivered.failures > 0 {
                            self.stats.record_retried_delivery();
                            info!(
                                rule_id = %event.rule_id(),
                                alert_id = %event.alert_id(),
                                attempts = delivered.failures + 1,
                                "Alert delivery succeeded after retry"
                            );
                        }
                    }
                    report.delivered += 1;
                }
                Err(error) => {
                    self.stats.record_sink_failure();
                    let Some(front) = slot.outbox.front_mut() else {
                        break;
                    };
                    front.record_failure(error.clone(), &self.retry_policy);

                    if error.is_retryable() && !self.retry_policy.exhausted(front.failures) {
                        warn!(
                            rule_id = %event.rule_id(),
                            alert_id = %event.alert_id(),
                            attempts = front.failures,
                            error = %error,
                            "Alert delivery retry failed"
                        );
                        break;
                    }

                    if let Some(abandoned) = slot.outbox.pop_front() {
                        self.dead_letter(abandoned.event, abandoned.failures, &error);
                        report.dead_lettered += 1;
                    }
                }
            }
        }
    }

    fn dead_letter(&self, event: AlertEvent, attempts: u32, error: &SinkError) {
        self.stats.record_dead_letter();
        self.dead_letters.push(event, attempts, error);
    }

    pub async fn health(&self) -> EngineHealth {
        let summary = self.tracker.summary().await;
        EngineHealth {
            store: self.store.health(),
            tracked_rules: summary.tracked_rules,
            pending_rules: summary.pending,
            open_alerts: summary.open_alerts,
            pending_deliveries: summary.pending_deliveries,
            dead_letters: self.dead_letters.len(),
            stats: self.stats.snapshot(),
        }
    }
}
