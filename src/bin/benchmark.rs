use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use vigil::alerts::{AlertRepository, AlertTriggerEngine, MemoryAlertStore};
use vigil::ingest::{MetricSample, PartitionedDispatcher};
use vigil::rules::{AlertRule, AlertRuleRepository, MemoryRuleRepository, Severity};
use vigil::EngineConfig;

const HOSTS: &[&str] = &["web-1", "web-2", "web-3", "db-1", "db-2", "cache-1", "api-1", "api-2"];
const METRICS: &[&str] = &["cpu_percent", "memory_percent", "disk_percent", "p99_latency_ms"];
const OPERATORS: &[&str] = &["GT", "GTE", "LT", "LTE"];

fn fast_random(seed: &mut u64) -> u64 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 7;
    *seed ^= *seed << 17;
    *seed
}

fn metric_keys() -> Vec<String> {
    HOSTS
        .iter()
        .flat_map(|host| METRICS.iter().map(move |metric| format!("{}.{}", host, metric)))
        .collect()
}

fn generate_rules(keys: &[String], rules_per_key: usize, seed: &mut u64) -> Vec<AlertRule> {
    keys.iter()
        .flat_map(|key| (0..rules_per_key).map(move |i| (key, i)))
        .map(|(key, i)| {
            let severity = match fast_random(seed) % 3 {
                0 => Severity::Info,
                1 => Severity::Warning,
                _ => Severity::Critical,
            };
            AlertRule::new(
                format!("{}-{}", key, i),
                format!("{} rule {}", key, i),
                key.clone(),
                OPERATORS[fast_random(seed) as usize % OPERATORS.len()],
            )
            .with_threshold((fast_random(seed) % 100) as f64)
            .with_severity(severity)
            .with_consecutive_breaches(1 + (fast_random(seed) % 3) as u32)
        })
        .collect()
}

fn generate_samples(keys: &[String], count: usize, seed: &mut u64) -> Vec<MetricSample> {
    let now = Utc::now();
    (0..count)
        .map(|_| {
            let key = &keys[fast_random(seed) as usize % keys.len()];
            let value = (fast_random(seed) % 1000) as f64 / 10.0;
            MetricSample::new(key.clone(), value, now)
        })
        .collect()
}

struct BenchmarkStats {
    total_samples: usize,
    total_duration: Duration,
}

impl BenchmarkStats {
    fn samples_per_sec(&self) -> f64 {
        self.total_samples as f64 / self.total_duration.as_secs_f64()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let num_samples: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let rules_per_key: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);
    let workers: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(num_cpus::get);

    let keys = metric_keys();
    let mut seed: u64 = 12345;
    let rules = generate_rules(&keys, rules_per_key, &mut seed);

    println!("Vigil Benchmark");
    println!("===============");
    println!("Metric keys:     {}", keys.len());
    println!("Rules:           {}", rules.len());
    println!("Samples:         {}", num_samples);
    println!("Workers:         {}", workers);
    println!();

    let repo = Arc::new(MemoryRuleRepository::with_rules(rules));
    let alerts = Arc::new(MemoryAlertStore::new());
    let engine = Arc::new(AlertTriggerEngine::new(
        &EngineConfig::default(),
        repo as Arc<dyn AlertRuleRepository>,
        Arc::clone(&alerts) as Arc<dyn AlertRepository>,
    ));
    engine.refresh_rules().await?;

    let samples = generate_samples(&keys, num_samples, &mut seed);

    print!("Benchmarking direct evaluation... ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let start = Instant::now();
    let mut events = 0;
    for sample in &samples {
        events += engine.on_sample(sample).await.len();
    }
    let direct = BenchmarkStats {
        total_samples: samples.len(),
        total_duration: start.elapsed(),
    };
    println!("done");
    println!("  Samples/sec: {:.0}", direct.samples_per_sec());
    println!("  Total time:  {:?}", direct.total_duration);
    println!("  Events:      {}", events);
    println!();

    print!("Benchmarking partitioned dispatch... ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let dispatcher = PartitionedDispatcher::spawn(Arc::clone(&engine), workers);
    let start = Instant::now();
    for sample in samples {
        dispatcher.dispatch(sample).await?;
    }
    let summary = dispatcher.shutdown().await;
    let dispatched = BenchmarkStats {
        total_samples: summary.samples as usize,
        total_duration: start.elapsed(),
    };
    println!("done");
    println!("  Samples/sec: {:.0}", dispatched.samples_per_sec());
    println!("  Total time:  {:?}", dispatched.total_duration);
    println!("  Events:      {}", summary.events);
    println!();

    let health = engine.health().await;
    println!("Engine Statistics:");
    println!("  Rule evaluations: {}", health.stats.rule_evaluations);
    println!("  Alerts opened:    {}", health.stats.alerts_opened);
    println!("  Alerts resolved:  {}", health.stats.alerts_resolved);
    println!("  Open alerts:      {}", health.open_alerts);
    println!("  Stored alerts:    {}", alerts.len());

    Ok(())
}
