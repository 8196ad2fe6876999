//! Key-partitioned sample dispatch
//!
//! Samples are routed to a fixed worker by a hash of their metric key. A key
//! always lands on the same worker, so its samples are evaluated in arrival
//! order, while different keys are spread across workers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sample::MetricSample;
use super::IngestError;
use crate::alerts::AlertTriggerEngine;

/// Per-worker queue depth
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Totals reported at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub samples: u64,
    pub events: u64,
}

pub struct PartitionedDispatcher {
    senders: Vec<mpsc::Sender<MetricSample>>,
    workers: Vec<JoinHandle<DispatchSummary>>,
}

impl PartitionedDispatcher {
    pub fn spawn(engine: Arc<AlertTriggerEngine>, workers: usize) -> Self {
        Self::with_capacity(engine, workers, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(engine: Arc<AlertTriggerEngine>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<MetricSample>(capacity.max(1));
            let engine = Arc::clone(&engine);

            handles.push(tokio::spawn(async move {
                let mut summary = DispatchSummary::default();
                while let Some(sample) = rx.recv().await {
                    let events = engine.on_sample(&sample).await;
                    summary.samples += 1;
                    summary.events += events.len() as u64;
                }
                tracing::debug!(worker, samples = summary.samples, "Dispatch worker drained");
                summary
            }));
            senders.push(tx);
        }

        tracing::info!("Sample dispatcher started with {} workers", workers);
        Self {
            senders,
            workers: handles,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }

    /// Worker a metric key is pinned to
    pub fn partition_for(&self, metric_key: &str) -> usize {
        let hash = fxhash::hash64(metric_key.as_bytes());
        (hash as usize) % self.senders.len()
    }

    /// Queue a sample, waiting if its worker is saturated
    pub async fn dispatch(&self, sample: MetricSample) -> Result<(), IngestError> {
        let partition = self.partition_for(&sample.metric_key);
        self.senders[partition]
            .send(sample)
            .await
            .map_err(|_| IngestError::WorkerStopped(partition))
    }

    /// Close the queues and wait for every queued sample to be evaluated
    pub async fn shutdown(self) -> DispatchSummary {
        drop(self.senders);

        let mut total = DispatchSummary::default();
        for handle in self.workers {
            match handle.await {
                Ok(summary) => {
                    total.samples += summary.samples;
                    total.events += summary.events;
                }
                Err(e) => tracing::error!(error = %e, "Dispatch worker panicked"),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRepository, MemoryAlertStore};
    use crate::config::EngineConfig;
    use crate::rules::{AlertRule, AlertRuleRepository, MemoryRuleRepository};
    use chrono::Utc;

    fn engine(alerts: &Arc<MemoryAlertStore>) -> Arc<AlertTriggerEngine> {
        let rules = Arc::new(MemoryRuleRepository::with_rules(
            (0..8).map(|i| {
                AlertRule::new(format!("r{}", i), "Rule", format!("m{}", i), "GT")
                    .with_threshold(50.0)
            }),
        ));
        Arc::new(AlertTriggerEngine::new(
            &EngineConfig::default(),
            rules as Arc<dyn AlertRuleRepository>,
            Arc::clone(alerts) as Arc<dyn AlertRepository>,
        ))
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let alerts = Arc::new(MemoryAlertStore::new());
        let dispatcher = PartitionedDispatcher::spawn(engine(&alerts), 4);

        assert_eq!(dispatcher.num_workers(), 4);
        let p = dispatcher.partition_for("cpu.usage");
        assert_eq!(p, dispatcher.partition_for("cpu.usage"));
        assert!(p < 4);

        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_key_order_is_kept() {
        let alerts = Arc::new(MemoryAlertStore::new());
        let dispatcher = PartitionedDispatcher::with_capacity(engine(&alerts), 4, 8);

        // Alternate breach / recovery on every key: each pair opens then resolves
        for round in 0..10 {
            for i in 0..8 {
                let value = if round % 2 == 0 { 90.0 } else { 10.0 };
                dispatcher
                    .dispatch(MetricSample::new(format!("m{}", i), value, Utc::now()))
                    .await
                    .unwrap();
            }
        }

        let summary = dispatcher.shutdown().await;
        assert_eq!(summary.samples, 80);
        assert_eq!(summary.events, 80);
        assert!(alerts.open_alerts().is_empty());
        assert_eq!(alerts.len(), 40);
    }
}
