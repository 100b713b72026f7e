use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, StoreError};
use crate::rule::{EvaluationPhase, Rule};

/// Source of active rules for a form and phase.
///
/// Implementations must return rules ordered by ascending priority, ties
/// broken by ascending rule id. An empty result is not an error. Catalogs
/// are re-read on every call: rule sets are never cached across requests.
#[async_trait]
pub trait RuleCatalog: Send + Sync {
    async fn active_rules(
        &self,
        form_id: i64,
        phase: EvaluationPhase,
    ) -> Result<Vec<Rule>, EngineError>;
}

/// Reads the current field values of a submission.
#[async_trait]
pub trait FieldValueRepository: Send + Sync {
    async fn submission_values(
        &self,
        submission_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>, StoreError>;
}

/// Versioned history entry for a stored rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleRevision {
    pub version: u32,
    pub rule: Rule,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

impl RuleRevision {
    fn new(version: u32, rule: Rule, updated_by: Option<String>) -> Self {
        Self {
            version,
            rule,
            created_at: Utc::now(),
            updated_by,
        }
    }
}

#[derive(Default)]
struct FormRules {
    rules: HashMap<i64, Vec<RuleRevision>>,
}

/// In-memory rule catalog with version tracking, keyed by form.
///
/// Every update appends a new revision; disabling appends a revision with
/// `enabled = false`, so history is never lost and the active set always
/// reflects the latest revision of each rule.
#[derive(Clone)]
pub struct InMemoryRuleCatalog {
    inner: Arc<RwLock<HashMap<i64, FormRules>>>,
    next_id: Arc<RwLock<i64>>,
}

impl Default for InMemoryRuleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuleCatalog {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            next_id: Arc::new(RwLock::new(1)),
        }
    }

    /// Returns the latest revision of every rule on the form.
    pub fn list_rules(&self, form_id: i64) -> Vec<RuleRevision> {
        let inner = self.inner.read();
        inner
            .get(&form_id)
            .map(|form| {
                form.rules
                    .values()
                    .filter_map(|revisions| revisions.last().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the full history for a specific rule.
    pub fn rule_history(&self, form_id: i64, rule_id: i64) -> Vec<RuleRevision> {
        let inner = self.inner.read();
        inner
            .get(&form_id)
            .and_then(|form| form.rules.get(&rule_id).cloned())
            .unwrap_or_default()
    }

    /// Returns the latest revision of a rule, if available.
    pub fn latest_rule(&self, form_id: i64, rule_id: i64) -> Option<RuleRevision> {
        let inner = self.inner.read();
        inner
            .get(&form_id)
            .and_then(|form| form.rules.get(&rule_id))
            .and_then(|revisions| revisions.last().cloned())
    }

    /// Inserts or updates a rule, returning the new revision. A rule with id
    /// zero is assigned the next free id.
    pub fn put_rule(&self, mut rule: Rule, updated_by: Option<String>) -> RuleRevision {
        if rule.id == 0 {
            let mut next = self.next_id.write();
            rule.id = *next;
            *next += 1;
        } else {
            let mut next = self.next_id.write();
            *next = (*next).max(rule.id + 1);
        }

        let mut inner = self.inner.write();
        let form = inner.entry(rule.form_id).or_default();
        let revisions = form.rules.entry(rule.id).or_default();
        let version = revisions.last().map(|last| last.version + 1).unwrap_or(1);
        let revision = RuleRevision::new(version, rule, updated_by);
        revisions.push(revision.clone());
        revision
    }

    /// Disables a rule by appending a new revision with `enabled = false`.
    pub fn disable_rule(
        &self,
        form_id: i64,
        rule_id: i64,
        updated_by: Option<String>,
    ) -> Result<RuleRevision, StoreError> {
        let mut inner = self.inner.write();
        let form = inner
            .get_mut(&form_id)
            .ok_or(StoreError::RuleNotFound(rule_id))?;
        let revisions = form
            .rules
            .get_mut(&rule_id)
            .ok_or(StoreError::RuleNotFound(rule_id))?;
        let latest = revisions
            .last()
            .cloned()
            .ok_or(StoreError::RuleNotFound(rule_id))?;

        if !latest.rule.enabled {
            return Ok(latest);
        }

        let mut disabled = latest.rule.clone();
        disabled.enabled = false;
        let revision = RuleRevision::new(latest.version + 1, disabled, updated_by);
        revisions.push(revision.clone());
        Ok(revision)
    }
}

#[async_trait]
impl RuleCatalog for InMemoryRuleCatalog {
    async fn active_rules(
        &self,
        form_id: i64,
        phase: EvaluationPhase,
    ) -> Result<Vec<Rule>, EngineError> {
        let mut rules: Vec<Rule> = self
            .list_rules(form_id)
            .into_iter()
            .map(|revision| revision.rule)
            .filter(|rule| rule.is_enabled() && rule.phase == phase)
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionSource, ComparisonOp, RuleCondition};
    use serde_json::json;

    fn sample_rule(id: i64, priority: i32, phase: EvaluationPhase) -> Rule {
        Rule {
            id,
            form_id: 10,
            name: format!("rule {id}"),
            description: None,
            phase,
            priority,
            enabled: true,
            condition: RuleCondition {
                source: ConditionSource::Field {
                    field_code: "STATUS".into(),
                },
                operator_raw: "=".into(),
                operator: ComparisonOp::Equals,
                value: json!("open"),
            },
            actions: vec![],
            else_actions: vec![],
        }
    }

    #[test]
    fn versioning_is_tracked() {
        let catalog = InMemoryRuleCatalog::new();
        let first = catalog.put_rule(sample_rule(0, 10, EvaluationPhase::PreSubmit), None);
        assert_eq!(first.version, 1);
        assert_eq!(first.rule.id, 1);

        let mut updated = first.rule.clone();
        updated.description = Some("updated".into());
        let second = catalog.put_rule(updated, Some("alice".into()));
        assert_eq!(second.version, 2);
        assert_eq!(second.updated_by.as_deref(), Some("alice"));

        let history = catalog.rule_history(10, 1);
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn disabled_rules_leave_the_active_set() {
        let catalog = InMemoryRuleCatalog::new();
        let revision = catalog.put_rule(sample_rule(0, 10, EvaluationPhase::PreSubmit), None);

        let disabled = catalog
            .disable_rule(10, revision.rule.id, Some("system".into()))
            .expect("disable rule");
        assert!(!disabled.rule.enabled);
        assert_eq!(disabled.version, revision.version + 1);

        let active = catalog
            .active_rules(10, EvaluationPhase::PreSubmit)
            .await
            .unwrap();
        assert!(active.is_empty(), "disabled rules should be skipped");
    }

    #[tokio::test]
    async fn active_rules_are_ordered_by_priority_then_id() {
        let catalog = InMemoryRuleCatalog::new();
        catalog.put_rule(sample_rule(5, 20, EvaluationPhase::PreSubmit), None);
        catalog.put_rule(sample_rule(3, 10, EvaluationPhase::PreSubmit), None);
        catalog.put_rule(sample_rule(2, 10, EvaluationPhase::PreSubmit), None);
        catalog.put_rule(sample_rule(9, 10, EvaluationPhase::PreOpen), None);

        let active = catalog
            .active_rules(10, EvaluationPhase::PreSubmit)
            .await
            .unwrap();
        let ids: Vec<i64> = active.iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![2, 3, 5]);
    }
}
