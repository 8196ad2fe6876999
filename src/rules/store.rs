//! Read-side cache of enabled alert rules
//!
//! The store holds one immutable [`RuleSnapshot`] behind an `Arc`. Readers
//! clone the `Arc` and evaluate against it for as long as they like; a refresh
//! builds a complete new snapshot and swaps the pointer, so a reader sees
//! either the old rule set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::model::{AlertRule, RuleId};

/// Source of truth for rule definitions
#[async_trait]
pub trait AlertRuleRepository: Send + Sync {
    /// Fetch every enabled rule
    async fn find_all_enabled(&self) -> Result<Vec<AlertRule>, RuleStoreError>;
}

/// Immutable, indexed view of the enabled rule set
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    by_metric: HashMap<String, Vec<Arc<AlertRule>>>,
    by_id: HashMap<RuleId, Arc<AlertRule>>,
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl RuleSnapshot {
    /// Index `rules` by metric key, worst severity first
    pub fn build(rules: Vec<AlertRule>, generation: u64, loaded_at: DateTime<Utc>) -> Self {
        let mut by_metric: HashMap<String, Vec<Arc<AlertRule>>> = HashMap::new();
        let mut by_id = HashMap::with_capacity(rules.len());

        for rule in rules {
            if !rule.enabled {
                tracing::debug!(rule_id = %rule.id, "Skipping disabled rule from repository");
                continue;
            }
            if by_id.contains_key(&rule.id) {
                tracing::warn!(rule_id = %rule.id, "Duplicate rule id in repository, keeping first");
                continue;
            }

            let rule = Arc::new(rule);
            by_id.insert(rule.id.clone(), Arc::clone(&rule));
            by_metric
                .entry(rule.metric_key.clone())
                .or_default()
                .push(rule);
        }

        for rules in by_metric.values_mut() {
            rules.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
        }

        Self {
            by_metric,
            by_id,
            generation,
            loaded_at: Some(loaded_at),
        }
    }

    /// Enabled rules watching `metric_key`, ordered by severity descending
    pub fn rules_for(&self, metric_key: &str) -> &[Arc<AlertRule>] {
        self.by_metric
            .get(metric_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<AlertRule>> {
        self.by_id.get(rule_id)
    }

    /// Every rule in the snapshot, in no particular order
    pub fn rules(&self) -> impl Iterator<Item = &Arc<AlertRule>> {
        self.by_id.values()
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.by_id.contains_key(rule_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Monotonic counter bumped on every successful refresh; 0 means never loaded
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

/// Freshness report for the rule snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// Last refresh attempt failed and the store is serving older rules
    pub degraded: bool,
    /// Snapshot is older than the configured maximum staleness (or was never loaded)
    pub stale: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub rule_count: usize,
}

#[derive(Debug, Default)]
struct RefreshStatus {
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Snapshot cache in front of an [`AlertRuleRepository`]
pub struct AlertRuleStore {
    repository: Arc<dyn AlertRuleRepository>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    /// Next read should re-fetch
    invalidated: AtomicBool,
    /// Only one refresh talks to the repository at a time
    refresh_lock: tokio::sync::Mutex<()>,
    status: RwLock<RefreshStatus>,
    max_staleness: Duration,
}

impl AlertRuleStore {
    /// Create an empty store; the first read loads from the repository
    pub fn new(repository: Arc<dyn AlertRuleRepository>, max_staleness: Duration) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
            invalidated: AtomicBool::new(true),
            refresh_lock: tokio::sync::Mutex::new(()),
            status: RwLock::new(RefreshStatus::default()),
            max_staleness,
        }
    }

    /// Current snapshot without touching the repository
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    /// Current snapshot, re-fetched first if the store was invalidated
    pub async fn snapshot(&self) -> Arc<RuleSnapshot> {
        if self.invalidated.load(Ordering::Acquire) {
            let _guard = self.refresh_lock.lock().await;
            // Another caller may have refreshed while we waited
            if self.invalidated.load(Ordering::Acquire) {
                if let Err(e) = self.refresh_locked().await {
                    tracing::warn!(error = %e, "Serving last known rule snapshot");
                }
            }
        }
        self.current()
    }

    /// Enabled rules for `metric_key`, worst severity first
    pub async fn get_rules_for(&self, metric_key: &str) -> Vec<Arc<AlertRule>> {
        self.snapshot().await.rules_for(metric_key).to_vec()
    }

    /// Force the next read to re-fetch from the repository
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Re-fetch now and swap in the new snapshot.
    ///
    /// On failure the previous snapshot stays in place and the store reports
    /// itself degraded until a refresh succeeds.
    pub async fn refresh(&self) -> Result<Arc<RuleSnapshot>, RuleStoreError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<Arc<RuleSnapshot>, RuleStoreError> {
        // Cleared before fetching: an invalidate() racing with the fetch
        // must trigger another one.
        self.invalidated.store(false, Ordering::Release);

        match self.repository.find_all_enabled().await {
            Ok(rules) => {
                let generation = self.current().generation() + 1;
                let snapshot = Arc::new(RuleSnapshot::build(rules, generation, Utc::now()));
                *self.snapshot.write() = Arc::clone(&snapshot);

                let mut status = self.status.write();
                if status.consecutive_failures > 0 {
                    tracing::info!(
                        failures = status.consecutive_failures,
                        "Rule repository recovered"
                    );
                }
                *status = RefreshStatus::default();

                tracing::debug!(
                    generation,
                    rules = snapshot.len(),
                    "Rule snapshot refreshed"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let mut status = self.status.write();
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = Some(e.to_string());
                tracing::error!(
                    error = %e,
                    failures = status.consecutive_failures,
                    generation = self.current().generation(),
                    "Rule refresh failed"
                );
                Err(e)
            }
        }
    }

    pub fn health(&self) -> StoreHealth {
        let snapshot = self.current();
        let status = self.status.read();
        let stale = match snapshot.loaded_at() {
            Some(loaded_at) => (Utc::now() - loaded_at)
                .to_std()
                .map(|age| age > self.max_staleness)
                .unwrap_or(false),
            None => true,
        };

        StoreHealth {
            degraded: status.consecutive_failures > 0,
            stale,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
            last_refreshed_at: snapshot.loaded_at(),
            generation: snapshot.generation(),
            rule_count: snapshot.len(),
        }
    }
}

/// Rule repository and refresh errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleStoreError {
    #[error("Rule repository unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read rules: {0}")]
    Io(String),

    #[error("Failed to parse rules: {0}")]
    Parse(String),
}
