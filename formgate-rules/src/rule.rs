use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{RawAction, RuleAction};
use crate::condition::{RawCondition, RuleCondition};
use crate::error::EngineError;

/// Moment at which a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    /// Evaluated when a user opens a form, before any field values exist.
    PreOpen,
    /// Evaluated at submission time with the full submitted field-value set.
    PreSubmit,
}

impl EvaluationPhase {
    /// Parses a caller-supplied phase literal. Anything outside the two
    /// accepted spellings is a request-validation error, rejected before any
    /// rule is loaded.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw {
            "pre_open" | "PreOpen" => Ok(EvaluationPhase::PreOpen),
            "pre_submit" | "PreSubmit" => Ok(EvaluationPhase::PreSubmit),
            other => Err(EngineError::InvalidPhase(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationPhase::PreOpen => "pre_open",
            EvaluationPhase::PreSubmit => "pre_submit",
        }
    }
}

impl fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative rule attached to a form.
///
/// A rule belongs to exactly one form and one phase. Its effects are
/// request-scoped: disabling or deleting a rule removes it from future
/// evaluation without cascading to already-applied effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// Unique identifier for the rule. Used for reporting and tie-breaking.
    pub id: i64,
    /// Form the rule is attached to.
    pub form_id: i64,
    /// Human readable rule name, reported on block decisions.
    pub name: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Evaluation moment.
    pub phase: EvaluationPhase,
    /// Ordering priority. Lower numbers are evaluated first; ties are broken
    /// by ascending rule id.
    #[serde(default = "Rule::default_priority")]
    pub priority: i32,
    /// Whether the rule is active.
    #[serde(default = "Rule::default_enabled")]
    pub enabled: bool,
    /// Matching condition for the rule.
    pub condition: RuleCondition,
    /// Actions executed in declared order when the condition matches.
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Actions executed in declared order when the condition does not match.
    #[serde(default)]
    pub else_actions: Vec<RuleAction>,
}

impl Rule {
    pub fn default_priority() -> i32 {
        100
    }

    pub fn default_enabled() -> bool {
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Parses a raw storage row into the typed rule model.
    ///
    /// All structural problems (unknown action tags, missing required
    /// fields, malformed embedded CopyToDocument JSON, unknown operators)
    /// surface here as configuration errors, before any condition is
    /// evaluated.
    pub fn from_raw(raw: RawRule) -> Result<Self, EngineError> {
        let rule_id = raw.id;
        let phase = EvaluationPhase::parse(&raw.phase)
            .map_err(|_| EngineError::configuration(rule_id, format!("unknown phase `{}`", raw.phase)))?;

        let condition = RuleCondition::from_raw(raw.condition)
            .map_err(|message| EngineError::Configuration { rule_id, message })?;

        let actions = parse_actions(rule_id, raw.actions)?;
        let else_actions = parse_actions(rule_id, raw.else_actions)?;

        Ok(Rule {
            id: rule_id,
            form_id: raw.form_id,
            name: raw.name,
            description: raw.description,
            phase,
            priority: raw.priority,
            enabled: raw.enabled,
            condition,
            actions,
            else_actions,
        })
    }
}

fn parse_actions(rule_id: i64, raw: Vec<RawAction>) -> Result<Vec<RuleAction>, EngineError> {
    raw.into_iter()
        .map(|action| {
            RuleAction::from_raw(action).map_err(|message| EngineError::Configuration { rule_id, message })
        })
        .collect()
}

/// Storage shape of a rule: string-tagged actions with a polymorphic value
/// column, exactly as the authoring tables persist them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRule {
    pub id: i64,
    pub form_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub phase: String,
    #[serde(default = "Rule::default_priority")]
    pub priority: i32,
    #[serde(default = "Rule::default_enabled")]
    pub enabled: bool,
    pub condition: RawCondition,
    #[serde(default)]
    pub actions: Vec<RawAction>,
    #[serde(default)]
    pub else_actions: Vec<RawAction>,
}

impl RawRule {
    /// Convenience used by stores that keep condition/action columns as JSON.
    pub fn from_parts(
        id: i64,
        form_id: i64,
        name: String,
        description: Option<String>,
        phase: String,
        priority: i32,
        enabled: bool,
        condition: Value,
        actions: Value,
        else_actions: Value,
    ) -> Result<Self, String> {
        let condition: RawCondition =
            serde_json::from_value(condition).map_err(|err| format!("condition: {err}"))?;
        let actions: Vec<RawAction> = if actions.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(actions).map_err(|err| format!("actions: {err}"))?
        };
        let else_actions: Vec<RawAction> = if else_actions.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(else_actions).map_err(|err| format!("else actions: {err}"))?
        };

        Ok(RawRule {
            id,
            form_id,
            name,
            description,
            phase,
            priority,
            enabled,
            condition,
            actions,
            else_actions,
        })
    }
}
