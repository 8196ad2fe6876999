//! Alert persistence collaborators

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::model::{Alert, AlertId};

/// Maximum number of alert records kept by [`MemoryAlertStore`]
const MAX_ALERTS: usize = 10_000;

/// Destination for alert open/resolve side effects.
///
/// Both calls may be retried after a timeout whose outcome is unknown, so
/// implementations must be idempotent: creating an alert id that already
/// exists, or resolving one that is already resolved, succeeds.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Persist a newly opened alert, returning the id it was stored under
    async fn create(&self, alert: &Alert) -> Result<AlertId, SinkError>;

    /// Mark an alert resolved
    async fn resolve(&self, alert_id: &AlertId, resolved_at: DateTime<Utc>) -> Result<(), SinkError>;
}

/// Durable alert storage, queried at startup to rebuild firing state
#[async_trait]
pub trait AlertRepository: AlertSink {
    async fn find_open_by_rule_id(&self, rule_id: &str) -> Result<Option<Alert>, SinkError>;

    /// Every alert still open, whatever its rule
    async fn find_all_open(&self) -> Result<Vec<Alert>, SinkError>;
}

/// Alert sink errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("Alert sink unavailable: {0}")]
    Unavailable(String),

    #[error("Alert sink call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Alert not found: {0}")]
    NotFound(AlertId),

    #[error("Alert rejected: {0}")]
    Rejected(String),

    #[error("Delivery backlog full ({0} events waiting)")]
    BacklogFull(usize),
}

impl SinkError {
    /// Whether trying the same call again could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Timeout(_))
    }
}

/// In-process alert repository
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<HashMap<AlertId, Alert>>,
    unavailable: AtomicBool,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an alert directly, bypassing availability checks
    pub fn insert(&self, alert: Alert) {
        self.alerts.write().insert(alert.id.clone(), alert);
    }

    pub fn get(&self, id: &AlertId) -> Option<Alert> {
        self.alerts.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.read().values().cloned().collect();
        alerts.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        alerts
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        self.all().into_iter().filter(Alert::is_open).collect()
    }

    pub fn open_count_for(&self, rule_id: &str) -> usize {
        self.alerts
            .read()
            .values()
            .filter(|a| a.rule_id == rule_id && a.is_open())
            .count()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    /// Make every call fail, as an unreachable database would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SinkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SinkError::Unavailable(
                "memory alert store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AlertSink for MemoryAlertStore {
    async fn create(&self, alert: &Alert) -> Result<AlertId, SinkError> {
        self.check_available()?;
        let mut alerts = self.alerts.write();

        // Resolved history goes first when near capacity
        if alerts.len() >= MAX_ALERTS * 9 / 10 {
            alerts.retain(|_, a| a.is_open());
        }
        if alerts.len() >= MAX_ALERTS && !alerts.contains_key(&alert.id) {
            return Err(SinkError::Rejected(format!(
                "alert store full ({} open alerts)",
                alerts.len()
            )));
        }

        alerts
            .entry(alert.id.clone())
            .or_insert_with(|| alert.clone());
        Ok(alert.id.clone())
    }

    async fn resolve(&self, alert_id: &AlertId, resolved_at: DateTime<Utc>) -> Result<(), SinkError> {
        self.check_available()?;
        match self.alerts.write().get_mut(alert_id) {
            Some(alert) => {
                alert.resolve(resolved_at);
                Ok(())
            }
            None => Err(SinkError::NotFound(alert_id.clone())),
        }
    }
}

#[async_trait]
impl AlertRepository for MemoryAlertStore {
    async fn find_open_by_rule_id(&self, rule_id: &str) -> Result<Option<Alert>, SinkError> {
        self.check_available()?;
        Ok(self
            .alerts
            .read()
            .values()
            .filter(|a| a.rule_id == rule_id && a.is_open())
            .max_by(|a, b| a.opened_at.cmp(&b.opened_at))
            .cloned())
    }

    async fn find_all_open(&self) -> Result<Vec<Alert>, SinkError> {
        self.check_available()?;
        Ok(self.open_alerts())
    }
}
