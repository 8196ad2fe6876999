//! Rule id → firing state map with per-rule serialization
//!
//! Every rule owns one slot behind an async mutex. Whoever holds the slot
//! guard is the only party allowed to transition that rule's state or touch
//! its delivery outbox, and the guard is held across the sink call, so
//! samples for the same rule are applied and delivered strictly in order.
//! Distinct rules never contend.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::delivery::Outbox;
use super::model::AlertId;
use super::state::{AlertState, FiringStatus};
use crate::rules::RuleId;

/// Firing state plus undelivered events of one rule
#[derive(Debug)]
pub struct RuleSlot {
    pub state: AlertState,
    pub outbox: Outbox,
    /// Rule left the enabled set; drop the slot once the outbox drains
    retired: bool,
    /// Slot was removed from the map; holders must look it up again
    detached: bool,
}

impl RuleSlot {
    fn new(rule_id: &str) -> Self {
        Self {
            state: AlertState::new(rule_id),
            outbox: Outbox::new(),
            retired: false,
            detached: false,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark the rule gone. The slot is dropped by [`AlertStateTracker::release`]
    /// once nothing is left to deliver.
    pub fn retire(&mut self) {
        self.retired = true;
    }
}

pub type SlotGuard = OwnedMutexGuard<RuleSlot>;

/// Counts gathered across all slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSummary {
    pub tracked_rules: usize,
    pub pending: usize,
    pub open_alerts: usize,
    pub pending_deliveries: usize,
}

#[derive(Debug, Default)]
pub struct AlertStateTracker {
    slots: DashMap<RuleId, Arc<Mutex<RuleSlot>>>,
    /// Rules with a non-empty outbox
    backlogged: DashSet<RuleId>,
}

impl AlertStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for `rule_id`, creating it on first use.
    ///
    /// A retired slot is revived: the rule is back in the enabled set.
    pub async fn lock(&self, rule_id: &str) -> SlotGuard {
        loop {
            let slot = Arc::clone(
                self.slots
                    .entry(rule_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(RuleSlot::new(rule_id))))
                    .value(),
            );

            let mut guard = slot.lock_owned().await;
            if guard.detached {
                continue;
            }
            guard.retired = false;
            return guard;
        }
    }

    /// Lock the slot for `rule_id` only if one exists
    pub async fn lock_existing(&self, rule_id: &str) -> Option<SlotGuard> {
        loop {
            let slot = self.slots.get(rule_id).map(|s| Arc::clone(s.value()))?;
            let guard = slot.lock_owned().await;
            if !guard.detached {
                return Some(guard);
            }
        }
    }

    /// Drop a retired slot whose outbox is empty. Returns true if removed.
    pub fn release(&self, mut guard: SlotGuard) -> bool {
        if !guard.retired || !guard.outbox.is_empty() {
            return false;
        }

        let rule_id = guard.state.rule_id().to_string();
        // Attached slots are always the ones in the map
        self.slots.remove(&rule_id);
        self.backlogged.remove(&rule_id);
        guard.detached = true;
        tracing::debug!(rule_id = %rule_id, "Dropped state for retired rule");
        true
    }

    /// Seed `rule_id` as OPEN with an alert found in durable storage.
    ///
    /// Returns false, leaving the state alone, if the rule already tracks an
    /// open alert.
    pub async fn seed_open(&self, rule_id: &str, alert_id: AlertId) -> bool {
        let mut guard = self.lock(rule_id).await;
        if guard.state.is_open() {
            return false;
        }
        guard.state = AlertState::recovered(rule_id, alert_id);
        true
    }

    pub fn mark_backlogged(&self, rule_id: &str) {
        if !self.backlogged.contains(rule_id) {
            self.backlogged.insert(rule_id.to_string());
        }
    }

    pub fn unmark_backlogged(&self, rule_id: &str) {
        self.backlogged.remove(rule_id);
    }

    /// Rules with undelivered events
    pub fn backlogged(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.backlogged.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Clone of the current state of `rule_id`
    pub async fn state(&self, rule_id: &str) -> Option<AlertState> {
        let guard = self.lock_existing(rule_id).await?;
        Some(guard.state.clone())
    }

    pub async fn status(&self, rule_id: &str) -> FiringStatus {
        self.state(rule_id)
            .await
            .map(|s| s.status())
            .unwrap_or_default()
    }

    /// Walk every slot, waiting for each in turn
    pub async fn summary(&self) -> TrackerSummary {
        let slots: Vec<Arc<Mutex<RuleSlot>>> =
            self.slots.iter().map(|e| Arc::clone(e.value())).collect();

        let mut summary = TrackerSummary::default();
        for slot in slots {
            let guard = slot.lock().await;
            if guard.detached {
                continue;
            }
            summary.tracked_rules += 1;
            match guard.state.status() {
                FiringStatus::Open => summary.open_alerts += 1,
                FiringStatus::Pending => summary.pending += 1,
                FiringStatus::Clear => {}
            }
            summary.pending_deliveries += guard.outbox.len();
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::delivery::PendingDelivery;
    use crate::alerts::model::{AlertEvent, ResolveReason};
    use chrono::Utc;
    use std::time::Duration;

    fn resolved(rule_id: &str) -> AlertEvent {
        AlertEvent::AlertResolved {
            alert_id: AlertId::new("a-1"),
            rule_id: rule_id.to_string(),
            resolved_at: Utc::now(),
            reason: ResolveReason::RuleRemoved,
        }
    }

    #[tokio::test]
    async fn test_lock_creates_slot() {
        let tracker = AlertStateTracker::new();
        assert!(tracker.lock_existing("r1").await.is_none());

        {
            let guard = tracker.lock("r1").await;
            assert_eq!(guard.state.rule_id(), "r1");
            assert_eq!(guard.state.status(), FiringStatus::Clear);
        }
        assert_eq!(tracker.len(), 1);
        assert!(tracker.lock_existing("r1").await.is_some());
    }

    #[tokio::test]
    async fn test_same_rule_is_serialized() {
        let tracker = Arc::new(AlertStateTracker::new());
        let guard = tracker.lock("r1").await;

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let _guard = tracker.lock("r1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Another rule is not blocked
        let other = tokio::time::timeout(Duration::from_millis(100), tracker.lock("r2")).await;
        assert!(other.is_ok());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_open_rejects_second_alert() {
        let tracker = AlertStateTracker::new();

        assert!(tracker.seed_open("r1", AlertId::new("a-1")).await);
        assert!(!tracker.seed_open("r1", AlertId::new("a-2")).await);

        let state = tracker.state("r1").await.unwrap();
        assert_eq!(state.open_alert_id(), Some(&AlertId::new("a-1")));
        assert_eq!(tracker.status("r1").await, FiringStatus::Open);
    }

    #[tokio::test]
    async fn test_release_waits_for_outbox() {
        let tracker = AlertStateTracker::new();

        let mut guard = tracker.lock("r1").await;
        guard.outbox.push_back(PendingDelivery::queued(resolved("r1")));
        tracker.mark_backlogged("r1");
        guard.retire();
        assert!(!tracker.release(guard));
        assert_eq!(tracker.len(), 1);

        let mut guard = tracker.lock_existing("r1").await.unwrap();
        assert!(guard.is_retired());
        guard.outbox.clear();
        assert!(tracker.release(guard));

        assert!(tracker.is_empty());
        assert!(tracker.backlogged().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_on_released_slot_gets_fresh_state() {
        let tracker = Arc::new(AlertStateTracker::new());
        tracker.seed_open("r1", AlertId::new("a-1")).await;

        let mut guard = tracker.lock("r1").await;
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.lock("r1").await.state.status() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        guard.state.force_resolve(ResolveReason::RuleRemoved, Utc::now());
        guard.retire();
        assert!(tracker.release(guard));

        assert_eq!(waiter.await.unwrap(), FiringStatus::Clear);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_revives_retired_slot() {
        let tracker = AlertStateTracker::new();
        let mut guard = tracker.lock("r1").await;
        guard.outbox.push_back(PendingDelivery::queued(resolved("r1")));
        guard.retire();
        drop(guard);

        let guard = tracker.lock("r1").await;
        assert!(!guard.is_retired());
        assert_eq!(guard.outbox.len(), 1);
    }

    #[tokio::test]
    async fn test_summary() {
        let tracker = AlertStateTracker::new();
        tracker.seed_open("r1", AlertId::new("a-1")).await;
        drop(tracker.lock("r2").await);
        tracker
            .lock("r3")
            .await
            .outbox
            .push_back(PendingDelivery::queued(resolved("r3")));

        let summary = tracker.summary().await;
        assert_eq!(summary.tracked_rules, 3);
        assert_eq!(summary.open_alerts, 1);
        assert_eq!(summary.pending_deliveries, 1);
        assert_eq!(tracker.rule_ids(), vec!["r1", "r2", "r3"]);
    }
}
