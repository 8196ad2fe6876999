//! Alert state tracking and triggering
//!
//! Turns per-rule breach decisions into alert lifecycle events, one firing
//! state machine per rule, and delivers those events to an alert sink with
//! out-of-band retry.

pub mod delivery;
pub mod engine;
pub mod model;
pub mod sink;
pub mod state;
pub mod stats;
pub mod tracker;
pub mod worker;

pub use delivery::{DeadLetter, DeadLetterLog, RetryPolicy};
pub use engine::{AlertTriggerEngine, EngineError, EngineHealth, RecoveryReport, RetryReport};
pub use model::{Alert, AlertEvent, AlertEventKind, AlertId, AlertStatus, ResolveReason};
pub use sink::{AlertRepository, AlertSink, MemoryAlertStore, SinkError};
pub use state::{AlertState, FiringStatus};
pub use stats::{EngineStats, StatsSnapshot};
pub use tracker::{AlertStateTracker, TrackerSummary};
pub use worker::{RetryWorker, RuleRefreshWorker};
