//! Rule repository adapters

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::model::{AlertRule, RuleId};
use super::store::{AlertRuleRepository, RuleStoreError};

/// In-process rule repository
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rules: RwLock<HashMap<RuleId, AlertRule>>,
    unavailable: AtomicBool,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let repo = Self::new();
        for rule in rules {
            repo.upsert(rule);
        }
        repo
    }

    /// Insert or replace a rule, returning the previous definition
    pub fn upsert(&self, rule: AlertRule) -> Option<AlertRule> {
        self.rules.write().insert(rule.id.clone(), rule)
    }

    pub fn remove(&self, id: &str) -> Option<AlertRule> {
        self.rules.write().remove(id)
    }

    /// Enable/disable a rule
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.rules.write().get_mut(id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<AlertRule> {
        self.rules.read().get(id).cloned()
    }

    /// Make every fetch fail, as an unreachable database would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertRuleRepository for MemoryRuleRepository {
    async fn find_all_enabled(&self) -> Result<Vec<AlertRule>, RuleStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuleStoreError::Unavailable(
                "memory repository marked unavailable".to_string(),
            ));
        }

        let mut rules: Vec<AlertRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }
}

/// Rules read from a JSON file holding an array of rule objects.
///
/// The file is re-read on every fetch, so editing it and invalidating the
/// store is enough to pick up changes.
#[derive(Debug, Clone)]
pub struct JsonFileRuleRepository {
    path: PathBuf,
}

impl JsonFileRuleRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertRuleRepository for JsonFileRuleRepository {
    async fn find_all_enabled(&self) -> Result<Vec<AlertRule>, RuleStoreError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RuleStoreError::Io(format!("{}: {}", self.path.display(), e))
        })?;

        let rules: Vec<AlertRule> = serde_json::from_str(&contents).map_err(|e| {
            RuleStoreError::Parse(format!("{}: {}", self.path.display(), e))
        })?;

        Ok(rules.into_iter().filter(|r| r.enabled).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::Operator;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_repository_filters_disabled() {
        let repo = MemoryRuleRepository::with_rules(vec![
            AlertRule::new("b", "B", "cpu", "GT").with_threshold(1.0),
            AlertRule::new("a", "A", "cpu", "GT").with_threshold(1.0),
        ]);
        assert!(repo.set_enabled("b", false));
        assert!(!repo.set_enabled("missing", false));

        let rules = repo.find_all_enabled().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "a");
    }

    #[test]
    fn test_memory_repository_unavailable() {
        let repo = MemoryRuleRepository::new();
        repo.set_unavailable(true);
        assert!(matches!(
            tokio_test::block_on(repo.find_all_enabled()),
            Err(RuleStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_json_file_repository() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "cpu-high", "name": "CPU high", "metric_key": "cpu.usage",
                  "operator": "GT", "threshold": 90}},
                {{"id": "mem-low", "name": "Memory low", "metric_key": "mem.free",
                  "operator": "lte", "threshold": 10, "consecutive_breaches_required": 2}},
                {{"id": "off", "name": "Off", "metric_key": "x", "operator": "GT",
                  "enabled": false}}
            ]"#
        )
        .unwrap();

        let repo = JsonFileRuleRepository::new(file.path());
        let rules = repo.find_all_enabled().await.unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].operator, Operator::Lte);
        assert_eq!(rules[1].consecutive_breaches_required, 2);
    }

    #[tokio::test]
    async fn test_json_file_repository_errors() {
        let repo = JsonFileRuleRepository::new("/nonexistent/vigil/rules.json");
        assert!(matches!(
            repo.find_all_enabled().await,
            Err(RuleStoreError::Io(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let repo = JsonFileRuleRepository::new(file.path());
        assert!(matches!(
            repo.find_all_enabled().await,
            Err(RuleStoreError::Parse(_))
        ));
    }
}
