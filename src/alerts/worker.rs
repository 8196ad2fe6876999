use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use super::engine::AlertTriggerEngine;

/// Periodically re-fetches rules and reconciles tracked state
pub struct RuleRefreshWorker {
    engine: Arc<AlertTriggerEngine>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl RuleRefreshWorker {
    pub fn new(engine: Arc<AlertTriggerEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Rule refresh worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; the engine loads rules on first use
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                match self.engine.refresh_rules().await {
                    Ok(events) if !events.is_empty() => {
                        tracing::info!("Rule refresh resolved {} alerts", events.len());
                    }
                    Ok(_) => {}
                    // Already logged by the store; keep serving the last snapshot
                    Err(e) => tracing::debug!(error = %e, "Rule refresh failed"),
                }
            }

            tracing::info!("Rule refresh worker stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Drains delivery backlogs on a short tick
pub struct RetryWorker {
    engine: Arc<AlertTriggerEngine>,
    tick: Duration,
    running: Arc<AtomicBool>,
}

impl RetryWorker {
    pub fn new(engine: Arc<AlertTriggerEngine>, tick: Duration) -> Self {
        Self {
            engine,
            tick,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Retry worker started with tick {:?}", self.tick);

            let mut interval = time::interval(self.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;

                let report = self.engine.retry_pending().await;
                if report.dead_lettered > 0 {
                    tracing::warn!(
                        "Retry worker dead-lettered {} events ({} still pending)",
                        report.dead_lettered,
                        report.still_pending
                    );
                }
            }

            tracing::info!("Retry worker stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::sink::{AlertRepository, MemoryAlertStore};
    use crate::config::EngineConfig;
    use crate::rules::{AlertRule, AlertRuleRepository, MemoryRuleRepository};
    use chrono::Utc;

    fn rule() -> AlertRule {
        AlertRule::new("r1", "Rule", "cpu", "GT").with_threshold(1.0)
    }

    fn engine(
        rules: &Arc<MemoryRuleRepository>,
        alerts: &Arc<MemoryAlertStore>,
    ) -> Arc<AlertTriggerEngine> {
        let config = EngineConfig {
            retry_base_ms: 1,
            retry_max_backoff_ms: 5,
            ..EngineConfig::default()
        };
        Arc::new(AlertTriggerEngine::new(
            &config,
            Arc::clone(rules) as Arc<dyn AlertRuleRepository>,
            Arc::clone(alerts) as Arc<dyn AlertRepository>,
        ))
    }

    #[tokio::test]
    async fn test_retry_worker_drains_backlog() {
        let rules = Arc::new(MemoryRuleRepository::with_rules([rule()]));
        let alerts = Arc::new(MemoryAlertStore::new());
        let engine = engine(&rules, &alerts);

        alerts.set_unavailable(true);
        engine.on_metric_sample("cpu", 2.0, Utc::now()).await;
        assert!(alerts.is_empty());
        alerts.set_unavailable(false);

        let worker = Arc::new(RetryWorker::new(Arc::clone(&engine), Duration::from_millis(5)));
        let handle = Arc::clone(&worker).start();
        assert!(worker.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop();
        handle.await.unwrap();

        assert_eq!(alerts.open_count_for("r1"), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_refresh_worker_resolves_removed_rule() {
        let rules = Arc::new(MemoryRuleRepository::with_rules([rule()]));
        let alerts = Arc::new(MemoryAlertStore::new());
        let engine = engine(&rules, &alerts);

        engine.on_metric_sample("cpu", 2.0, Utc::now()).await;
        assert_eq!(alerts.open_count_for("r1"), 1);
        rules.remove("r1");

        let worker = Arc::new(RuleRefreshWorker::new(
            Arc::clone(&engine),
            Duration::from_millis(10),
        ));
        let handle = Arc::clone(&worker).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop();
        handle.await.unwrap();

        assert_eq!(alerts.open_count_for("r1"), 0);
    }
}
