//! Vigil: Threshold Alert Rule Evaluation Engine
//!
//! Evaluates incoming metric samples against enabled alert rules and turns
//! each rule's stream of breach decisions into alert open/resolve events.
//!
//! # Features
//!
//! - **Threshold Rules**: GT, LT, GTE, LTE and EQ comparisons; rules without a threshold never fire
//! - **Hysteresis**: optional consecutive-breach count before an alert opens
//! - **At Most One Open Alert**: per-rule firing state machine, serialized per rule id
//! - **Snapshot Rule Store**: atomically swapped rule set, keeps serving when the repository is down
//! - **Out-of-Band Delivery**: failed sink calls are retried with backoff, never rolled back
//! - **Recovery**: open alerts in storage are re-adopted after a restart
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::alerts::{AlertRepository, AlertTriggerEngine, MemoryAlertStore};
//! use vigil::rules::{AlertRule, AlertRuleRepository, MemoryRuleRepository};
//! use vigil::EngineConfig;
//!
//! # async fn run() -> Result<(), vigil::alerts::EngineError> {
//! let rules = Arc::new(MemoryRuleRepository::with_rules([
//!     AlertRule::new("cpu-high", "CPU high", "cpu.usage", "GT").with_threshold(90.0),
//! ]));
//! let alerts = Arc::new(MemoryAlertStore::new());
//!
//! let engine = AlertTriggerEngine::new(
//!     &EngineConfig::default(),
//!     rules as Arc<dyn AlertRuleRepository>,
//!     alerts as Arc<dyn AlertRepository>,
//! );
//! engine.recover().await?;
//!
//! let events = engine.on_metric_sample("cpu.usage", 95.0, chrono::Utc::now()).await;
//! println!("Events: {:?}", events);
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod ingest;
pub mod rules;

// Re-export commonly used types
pub use alerts::{AlertEvent, AlertTriggerEngine, EngineError};
pub use config::{ConfigError, EngineConfig};
pub use ingest::MetricSample;
pub use rules::{AlertRule, Operator, Severity};
