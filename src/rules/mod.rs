//! Alert rule definitions, threshold evaluation and the rule snapshot store

pub mod condition;
pub mod model;
pub mod repository;
pub mod store;

pub use condition::{ConditionError, ConditionEvaluator};
pub use model::{AlertRule, Operator, RuleFingerprint, RuleId, Severity};
pub use repository::{JsonFileRuleRepository, MemoryRuleRepository};
pub use store::{AlertRuleRepository, AlertRuleStore, RuleSnapshot, RuleStoreError, StoreHealth};
