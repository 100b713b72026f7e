use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::is_empty_value;
use crate::copy::CopyToDocumentResult;
use crate::procedure::ProcedureInvocationTrace;
use crate::rule::Rule;

/// Result of evaluating a single condition.
#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub error: Option<String>,
    pub procedure_trace: Option<ProcedureInvocationTrace>,
}

impl ConditionOutcome {
    pub fn matched(matched: bool) -> Self {
        Self {
            matched,
            error: None,
            procedure_trace: None,
        }
    }

    pub fn unmatched_with_error(message: String) -> Self {
        Self {
            matched: false,
            error: Some(message),
            procedure_trace: None,
        }
    }

    pub fn procedure_failure(message: String, trace: ProcedureInvocationTrace) -> Self {
        Self {
            matched: false,
            error: Some(message),
            procedure_trace: Some(trace),
        }
    }

    pub fn with_trace(mut self, trace: ProcedureInvocationTrace) -> Self {
        self.procedure_trace = Some(trace);
        self
    }
}

/// How one rule ended up after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEvaluationOutcome {
    /// Condition false and no ELSE list to run.
    NotMatched,
    /// Condition true, THEN actions applied.
    ActionsApplied,
    /// Condition false, ELSE actions applied.
    ElseActionsApplied,
    /// A Block action fired on this rule.
    Blocked,
    /// The condition (or an action) failed to evaluate; rule treated as
    /// non-matching.
    Error,
    /// Debug mode only: the rule matched after an earlier rule already
    /// blocked, so its actions were not applied.
    MatchedNotApplied,
}

/// Per-rule diagnostic record assembled in debug mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluationInfo {
    pub rule_id: i64,
    pub rule_name: String,
    pub condition_source: String,
    #[serde(default)]
    pub field_code: Option<String>,
    pub operator_original: String,
    pub operator_normalized: String,
    pub value: Value,
    pub matched: bool,
    pub outcome: RuleEvaluationOutcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub procedure_trace: Option<ProcedureInvocationTrace>,
}

impl RuleEvaluationInfo {
    pub fn for_rule(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            condition_source: rule.condition.source_label().to_string(),
            field_code: rule.condition.field_code().map(str::to_string),
            operator_original: rule.condition.operator_raw.clone(),
            operator_normalized: rule.condition.operator.as_str().to_string(),
            value: rule.condition.value.clone(),
            matched: false,
            outcome: RuleEvaluationOutcome::NotMatched,
            error: None,
            procedure_trace: None,
        }
    }
}

/// Verbose evaluation record returned alongside the blocking decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingRuleDebugInfo {
    /// Correlation id for log lookups; fresh per evaluation call.
    pub evaluation_id: Uuid,
    pub total_active_rules: usize,
    pub rules_evaluated: usize,
    pub evaluations: Vec<RuleEvaluationInfo>,
    /// Human-readable reason when zero rules apply.
    #[serde(default)]
    pub no_rules_reason: Option<String>,
}

impl BlockingRuleDebugInfo {
    pub fn new(total_active_rules: usize) -> Self {
        Self {
            evaluation_id: Uuid::new_v4(),
            total_active_rules,
            rules_evaluated: 0,
            evaluations: Vec::new(),
            no_rules_reason: None,
        }
    }
}

/// Aggregate result of a blocking-rule evaluation phase.
///
/// Built fresh per call: field values and document state can change between
/// requests, so nothing here is ever cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockingRuleResult {
    pub blocked: bool,
    #[serde(default)]
    pub block_message: Option<String>,
    #[serde(default)]
    pub matched_rule_id: Option<i64>,
    #[serde(default)]
    pub matched_rule_name: Option<String>,
    /// Outcomes of CopyToDocument actions executed during this evaluation.
    #[serde(default)]
    pub copy_results: Vec<CopyToDocumentResult>,
    #[serde(default)]
    pub debug: Option<BlockingRuleDebugInfo>,
}

/// Per-field behavior computed by the evaluated rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_value: Option<Value>,
}

impl FieldState {
    /// The value the field currently presents: computed wins over submitted,
    /// submitted wins over default.
    pub fn effective_value(&self) -> Option<&Value> {
        self.computed_value
            .as_ref()
            .or(self.submitted_value.as_ref())
            .or(self.default_value.as_ref())
    }
}

/// Request-scoped, in-memory mapping from field code to its computed state.
/// Deterministic iteration order keeps responses and audit output stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FieldStateMap {
    fields: BTreeMap<String, FieldState>,
}

impl FieldStateMap {
    pub fn from_submitted(values: &BTreeMap<String, Value>) -> Self {
        let fields = values
            .iter()
            .map(|(code, value)| {
                (
                    code.clone(),
                    FieldState {
                        submitted_value: Some(value.clone()),
                        ..FieldState::default()
                    },
                )
            })
            .collect();
        Self { fields }
    }

    fn entry(&mut self, field_code: &str) -> &mut FieldState {
        self.fields.entry(field_code.to_string()).or_default()
    }

    pub fn get(&self, field_code: &str) -> Option<&FieldState> {
        self.fields.get(field_code)
    }

    pub fn set_visible(&mut self, field_code: &str, visible: bool) {
        self.entry(field_code).visible = Some(visible);
    }

    pub fn set_read_only(&mut self, field_code: &str, read_only: bool) {
        self.entry(field_code).read_only = Some(read_only);
    }

    pub fn set_mandatory(&mut self, field_code: &str, mandatory: bool) {
        self.entry(field_code).mandatory = Some(mandatory);
    }

    /// Applies a default only when the field has no submitted value.
    pub fn set_default(&mut self, field_code: &str, value: Value) {
        let state = self.entry(field_code);
        if is_empty_value(state.submitted_value.as_ref()) {
            state.default_value = Some(value);
        }
    }

    /// Removes the field's current value: both the raw submitted value and
    /// any previously computed result. Defaults survive, and a later Compute
    /// action may repopulate the field.
    pub fn clear_value(&mut self, field_code: &str) {
        let state = self.entry(field_code);
        state.submitted_value = None;
        state.computed_value = None;
    }

    pub fn set_computed(&mut self, field_code: &str, value: Value) {
        self.entry(field_code).computed_value = Some(value);
    }

    /// Numeric view of a field's effective value, for Compute expressions.
    pub fn numeric_value(&self, field_code: &str) -> Option<f64> {
        self.get(field_code)
            .and_then(FieldState::effective_value)
            .and_then(crate::condition::value_as_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldState)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One client-facing validation problem found by ValidateFormRules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValidationError {
    #[serde(default)]
    pub field_code: Option<String>,
    pub message: String,
}

/// Output of ValidateFormRules: the evaluated field-state map plus any
/// validation errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormValidationResult {
    pub field_states: FieldStateMap,
    #[serde(default)]
    pub errors: Vec<FieldValidationError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_is_ignored_when_field_has_submitted_value() {
        let mut map = FieldStateMap::from_submitted(
            &[("TOTAL".to_string(), json!(200))].into_iter().collect(),
        );
        map.set_default("TOTAL", json!(0));
        map.set_default("CURRENCY", json!("EUR"));

        assert_eq!(map.get("TOTAL").unwrap().default_value, None);
        assert_eq!(map.get("CURRENCY").unwrap().default_value, Some(json!("EUR")));
    }

    #[test]
    fn clear_value_erases_submitted_and_computed_but_not_default() {
        let mut map = FieldStateMap::from_submitted(
            &[("VAT".to_string(), json!("21"))].into_iter().collect(),
        );
        map.set_computed("VAT", json!(42.0));
        map.set_default("VAT", json!("19"));
        map.clear_value("VAT");
        map.set_default("VAT", json!("19"));

        let state = map.get("VAT").unwrap();
        assert_eq!(state.submitted_value, None);
        assert_eq!(state.computed_value, None);
        assert_eq!(state.effective_value(), Some(&json!("19")));
    }

    #[test]
    fn effective_value_prefers_computed_over_submitted() {
        let mut map = FieldStateMap::from_submitted(
            &[("NET".to_string(), json!(100))].into_iter().collect(),
        );
        assert_eq!(map.get("NET").unwrap().effective_value(), Some(&json!(100)));
        map.set_computed("NET", json!(121.0));
        assert_eq!(map.get("NET").unwrap().effective_value(), Some(&json!(121.0)));
    }
}
