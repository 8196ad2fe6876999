//! Vigil alert engine
//!
//! Run with: cargo run < samples.jsonl
//!
//! Reads newline-delimited JSON metric samples from stdin, e.g.
//! `{"metric_key": "cpu.usage", "value": 93.5}`, and evaluates them against
//! the rules in `VIGIL_RULES_FILE` (a JSON array of alert rules). Alerts are
//! kept in memory and summarized on exit.
//!
//! See `vigil::config` for the full list of environment variables.
//! - RUST_LOG: Log level (default: vigil=info)

use std::sync::Arc;

use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::alerts::{
    AlertRepository, AlertTriggerEngine, MemoryAlertStore, RetryWorker, RuleRefreshWorker,
};
use vigil::ingest::{PartitionedDispatcher, SampleReader};
use vigil::rules::{AlertRuleRepository, JsonFileRuleRepository};
use vigil::EngineConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::from_env();
    config.validate()?;

    let rules_file = config
        .rules_file
        .clone()
        .ok_or("VIGIL_RULES_FILE must point to a JSON rules file")?;
    tracing::info!("Loading rules from {}", rules_file.display());

    let rules: Arc<dyn AlertRuleRepository> = Arc::new(JsonFileRuleRepository::new(rules_file));
    let alerts = Arc::new(MemoryAlertStore::new());
    let engine = Arc::new(AlertTriggerEngine::new(
        &config,
        rules,
        Arc::clone(&alerts) as Arc<dyn AlertRepository>,
    ));

    let report = engine.recover().await?;
    tracing::info!(
        "Recovered {} open alerts, resolved {} stray alerts",
        report.seeded,
        report.orphaned + report.superseded
    );

    // Start background workers
    let refresh_worker = Arc::new(RuleRefreshWorker::new(
        Arc::clone(&engine),
        config.rule_refresh_interval(),
    ));
    let refresh_handle = Arc::clone(&refresh_worker).start();

    let retry_worker = Arc::new(RetryWorker::new(Arc::clone(&engine), config.retry_tick()));
    let retry_handle = Arc::clone(&retry_worker).start();

    let dispatcher = PartitionedDispatcher::spawn(Arc::clone(&engine), config.workers);
    let mut reader = SampleReader::new(BufReader::new(tokio::io::stdin()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, stopping...");
                break;
            }
            next = reader.next_sample() => match next {
                Some(Ok(sample)) => dispatcher.dispatch(sample).await?,
                Some(Err(e)) if e.is_fatal() => {
                    tracing::error!(error = %e, "Input failed, stopping ingest");
                    break;
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Skipping sample"),
                None => {
                    tracing::info!("End of input after {} lines", reader.line_no());
                    break;
                }
            },
        }
    }

    let summary = dispatcher.shutdown().await;
    tracing::info!(
        "Evaluated {} samples, {} alert events",
        summary.samples,
        summary.events
    );

    // One last pass for anything still queued
    engine.retry_pending().await;
    refresh_worker.stop();
    retry_worker.stop();
    refresh_handle.abort();
    retry_handle.abort();

    let health = engine.health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    for alert in alerts.open_alerts() {
        println!("OPEN [{}] {} ({}): {}", alert.severity, alert.rule_name, alert.id, alert.message);
    }

    tracing::info!("Vigil stopped");
    Ok(())
}
