use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::outcome::ConditionOutcome;
use crate::procedure::{StoredProcedureConditionResolver, StoredProcedureSpec};

/// Canonical comparison operators supported by rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    InSet,
    Between,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    /// Translates a user-facing operator alias into its canonical operator.
    /// The original spelling is kept on the condition for diagnostics.
    pub fn normalize(raw: &str) -> Option<Self> {
        let folded = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match folded.as_str() {
            "equals" | "equal" | "eq" | "=" | "==" => Some(ComparisonOp::Equals),
            "not_equals" | "notequals" | "neq" | "ne" | "!=" | "<>" => Some(ComparisonOp::NotEquals),
            "contains" | "like" => Some(ComparisonOp::Contains),
            "greater_than" | "greaterthan" | "gt" | ">" => Some(ComparisonOp::GreaterThan),
            "less_than" | "lessthan" | "lt" | "<" => Some(ComparisonOp::LessThan),
            "greater_or_equal" | "greaterorequal" | "gte" | "ge" | ">=" => {
                Some(ComparisonOp::GreaterOrEqual)
            }
            "less_or_equal" | "lessorequal" | "lte" | "le" | "<=" => Some(ComparisonOp::LessOrEqual),
            "in_set" | "inset" | "in" | "any_of" => Some(ComparisonOp::InSet),
            "between" => Some(ComparisonOp::Between),
            "is_null" | "isnull" | "is_empty" | "empty" => Some(ComparisonOp::IsNull),
            "is_not_null" | "isnotnull" | "is_not_empty" | "not_empty" => {
                Some(ComparisonOp::IsNotNull)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Equals => "equals",
            ComparisonOp::NotEquals => "not_equals",
            ComparisonOp::Contains => "contains",
            ComparisonOp::GreaterThan => "greater_than",
            ComparisonOp::LessThan => "less_than",
            ComparisonOp::GreaterOrEqual => "greater_or_equal",
            ComparisonOp::LessOrEqual => "less_or_equal",
            ComparisonOp::InSet => "in_set",
            ComparisonOp::Between => "between",
            ComparisonOp::IsNull => "is_null",
            ComparisonOp::IsNotNull => "is_not_null",
        }
    }
}

/// Where a condition reads its left-hand value from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSource {
    /// The submitted value of a form field.
    Field { field_code: String },
    /// The selected result of a whitelisted stored procedure.
    StoredProcedure(StoredProcedureSpec),
}

/// Typed condition, produced from [`RawCondition`] at rule-load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCondition {
    pub source: ConditionSource,
    /// Operator exactly as the author wrote it.
    pub operator_raw: String,
    /// Canonical operator applied during evaluation.
    pub operator: ComparisonOp,
    /// Right-hand comparison value.
    pub value: Value,
}

impl RuleCondition {
    pub fn from_raw(raw: RawCondition) -> Result<Self, String> {
        let operator = ComparisonOp::normalize(&raw.operator)
            .ok_or_else(|| format!("unknown operator `{}`", raw.operator))?;

        let source = match raw.source.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "field" => {
                let field_code = raw
                    .field_code
                    .filter(|code| !code.trim().is_empty())
                    .ok_or("field-sourced condition requires a field code")?;
                ConditionSource::Field { field_code }
            }
            "stored_procedure" | "storedprocedure" | "procedure" => {
                let procedure_id = raw
                    .stored_procedure_id
                    .ok_or("procedure-sourced condition requires a stored procedure id")?;
                if raw.result_mapping.is_empty() && raw.selected_result_param.is_none() {
                    return Err(
                        "procedure-sourced condition requires a result mapping or a selected result parameter"
                            .to_string(),
                    );
                }
                ConditionSource::StoredProcedure(StoredProcedureSpec {
                    procedure_id,
                    parameter_mapping: raw.parameter_mapping,
                    result_mapping: raw.result_mapping,
                    selected_result_param: raw.selected_result_param,
                })
            }
            other => return Err(format!("unknown condition source `{other}`")),
        };

        Ok(RuleCondition {
            source,
            operator_raw: raw.operator,
            operator,
            value: raw.value,
        })
    }

    pub fn field_code(&self) -> Option<&str> {
        match &self.source {
            ConditionSource::Field { field_code } => Some(field_code),
            ConditionSource::StoredProcedure(spec) => spec.selected_result_param.as_deref(),
        }
    }

    pub fn source_label(&self) -> &'static str {
        match &self.source {
            ConditionSource::Field { .. } => "field",
            ConditionSource::StoredProcedure(_) => "stored_procedure",
        }
    }
}

/// Storage shape of a condition before load-time validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCondition {
    pub source: String,
    #[serde(default)]
    pub field_code: Option<String>,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub stored_procedure_id: Option<i64>,
    #[serde(default)]
    pub parameter_mapping: Vec<crate::procedure::ParameterBinding>,
    #[serde(default)]
    pub result_mapping: Vec<crate::procedure::ResultBinding>,
    #[serde(default)]
    pub selected_result_param: Option<String>,
}

/// Request-scoped context a condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub form_id: i64,
    pub submission_id: Option<i64>,
    /// Submitted field values. Empty or partial for `pre_open` evaluations.
    pub field_values: BTreeMap<String, Value>,
}

impl EvaluationContext {
    pub fn field_value(&self, code: &str) -> Option<&Value> {
        self.field_values.get(code)
    }
}

/// Resolves a condition's left-hand side and applies its operator.
pub struct ConditionEvaluator<'a> {
    resolver: &'a StoredProcedureConditionResolver,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(resolver: &'a StoredProcedureConditionResolver) -> Self {
        Self { resolver }
    }

    /// Evaluates the condition, producing a match flag, an optional error
    /// message, and (for procedure-sourced conditions) the invocation
    /// trace. Errors never propagate: a condition that cannot be evaluated
    /// simply does not match.
    pub async fn evaluate(
        &self,
        condition: &RuleCondition,
        ctx: &EvaluationContext,
    ) -> ConditionOutcome {
        match &condition.source {
            ConditionSource::Field { field_code } => {
                let left = ctx.field_value(field_code);
                match (left, condition.operator) {
                    (None, ComparisonOp::IsNull) => ConditionOutcome::matched(true),
                    (None, ComparisonOp::IsNotNull) => ConditionOutcome::matched(false),
                    (None, _) => ConditionOutcome::unmatched_with_error(format!(
                        "field `{field_code}` has no submitted value"
                    )),
                    (Some(left), op) => match apply_operator(op, left, &condition.value) {
                        Ok(matched) => ConditionOutcome::matched(matched),
                        Err(message) => ConditionOutcome::unmatched_with_error(message),
                    },
                }
            }
            ConditionSource::StoredProcedure(spec) => {
                let resolution = self.resolver.resolve(spec, ctx).await;
                let trace = resolution.trace;
                if let Some(error) = trace.error.clone() {
                    return ConditionOutcome::procedure_failure(error, trace);
                }
                match (resolution.value.as_ref(), condition.operator) {
                    (None, ComparisonOp::IsNull) => ConditionOutcome::matched(true).with_trace(trace),
                    (None, ComparisonOp::IsNotNull) => {
                        ConditionOutcome::matched(false).with_trace(trace)
                    }
                    (None, _) => ConditionOutcome::procedure_failure(
                        "stored procedure produced no comparison value".to_string(),
                        trace,
                    ),
                    (Some(left), op) => match apply_operator(op, left, &condition.value) {
                        Ok(matched) => ConditionOutcome::matched(matched).with_trace(trace),
                        Err(message) => ConditionOutcome::procedure_failure(message, trace),
                    },
                }
            }
        }
    }
}

/// Whether a value counts as empty: JSON null or a blank string.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(_) => false,
    }
}

/// Applies a canonical operator to two operands.
///
/// If both operands parse as numbers the comparison is numeric; otherwise it
/// falls back to ordinal case-insensitive string comparison. Malformed
/// right-hand collections for `in_set`/`between` are evaluation errors, not a
/// silent false.
pub fn apply_operator(op: ComparisonOp, left: &Value, right: &Value) -> Result<bool, String> {
    match op {
        ComparisonOp::IsNull => Ok(is_empty_value(Some(left))),
        ComparisonOp::IsNotNull => Ok(!is_empty_value(Some(left))),
        ComparisonOp::Equals => Ok(scalars_equal(left, right)),
        ComparisonOp::NotEquals => Ok(!scalars_equal(left, right)),
        ComparisonOp::Contains => {
            let haystack = value_to_text(left).to_ascii_lowercase();
            let needle = value_to_text(right).to_ascii_lowercase();
            Ok(haystack.contains(&needle))
        }
        ComparisonOp::GreaterThan => compare_ordering(left, right).map(|ord| ord.is_gt()),
        ComparisonOp::LessThan => compare_ordering(left, right).map(|ord| ord.is_lt()),
        ComparisonOp::GreaterOrEqual => compare_ordering(left, right).map(|ord| ord.is_ge()),
        ComparisonOp::LessOrEqual => compare_ordering(left, right).map(|ord| ord.is_le()),
        ComparisonOp::InSet => {
            let set = split_collection(right);
            if set.is_empty() {
                return Err(format!(
                    "in_set requires a non-empty delimited collection, got `{}`",
                    value_to_text(right)
                ));
            }
            Ok(set.iter().any(|candidate| text_equal(&value_to_text(left), candidate)))
        }
        ComparisonOp::Between => {
            let bounds = split_collection(right);
            if bounds.len() != 2 {
                return Err(format!(
                    "between requires exactly two delimited bounds, got `{}`",
                    value_to_text(right)
                ));
            }
            let left_text = value_to_text(left);
            match (
                parse_number(&left_text),
                parse_number(&bounds[0]),
                parse_number(&bounds[1]),
            ) {
                (Some(candidate), Some(low), Some(high)) => {
                    let (low, high) = if low <= high { (low, high) } else { (high, low) };
                    Ok(candidate >= low && candidate <= high)
                }
                _ => {
                    let candidate = left_text.to_ascii_lowercase();
                    let mut low = bounds[0].to_ascii_lowercase();
                    let mut high = bounds[1].to_ascii_lowercase();
                    if low > high {
                        std::mem::swap(&mut low, &mut high);
                    }
                    Ok(candidate >= low && candidate <= high)
                }
            }
        }
    }
}

fn scalars_equal(left: &Value, right: &Value) -> bool {
    match (value_as_number(left), value_as_number(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => text_equal(&value_to_text(left), &value_to_text(right)),
    }
}

fn compare_ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    match (value_as_number(left), value_as_number(right)) {
        (Some(l), Some(r)) => l
            .partial_cmp(&r)
            .ok_or_else(|| "numeric comparison produced no ordering".to_string()),
        _ => Ok(value_to_text(left)
            .to_ascii_lowercase()
            .cmp(&value_to_text(right).to_ascii_lowercase())),
    }
}

fn text_equal(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}

/// Splits a delimited right-hand collection. Semicolons win over commas so
/// comma-bearing values can still be listed.
fn split_collection(value: &Value) -> Vec<String> {
    if let Value::Array(items) = value {
        return items.iter().map(value_to_text).collect();
    }
    let text = value_to_text(value);
    let delimiter = if text.contains(';') { ';' } else { ',' };
    text.split(delimiter)
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_number(text),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("=", ComparisonOp::Equals; "single equals")]
    #[test_case("==", ComparisonOp::Equals; "double equals")]
    #[test_case("<>", ComparisonOp::NotEquals)]
    #[test_case(">", ComparisonOp::GreaterThan)]
    #[test_case("GTE", ComparisonOp::GreaterOrEqual)]
    #[test_case("In-Set", ComparisonOp::InSet)]
    #[test_case("is null", ComparisonOp::IsNull)]
    fn normalizes_operator_aliases(raw: &str, expected: ComparisonOp) {
        assert_eq!(ComparisonOp::normalize(raw), Some(expected));
    }

    #[test]
    fn rejects_unknown_operator() {
        assert_eq!(ComparisonOp::normalize("matches_regex"), None);
    }

    #[test_case(json!("15000"), json!("10000"), true; "numeric strings compare numerically")]
    #[test_case(json!(500), json!("10000"), false; "number below threshold")]
    #[test_case(json!("9"), json!("10"), false; "not lexicographic when numeric")]
    fn greater_than_prefers_numeric_comparison(left: Value, right: Value, expected: bool) {
        assert_eq!(
            apply_operator(ComparisonOp::GreaterThan, &left, &right).unwrap(),
            expected
        );
    }

    #[test]
    fn string_comparison_is_case_insensitive() {
        assert!(apply_operator(ComparisonOp::Equals, &json!("Approved"), &json!("APPROVED")).unwrap());
        assert!(apply_operator(ComparisonOp::Contains, &json!("Pending Review"), &json!("review")).unwrap());
    }

    #[test]
    fn in_set_splits_on_semicolons_and_commas() {
        assert!(apply_operator(ComparisonOp::InSet, &json!("B"), &json!("A;B;C")).unwrap());
        assert!(apply_operator(ComparisonOp::InSet, &json!("2"), &json!("1,2,3")).unwrap());
        assert!(!apply_operator(ComparisonOp::InSet, &json!("D"), &json!("A;B;C")).unwrap());
    }

    #[test]
    fn malformed_between_is_an_error_not_false() {
        let err = apply_operator(ComparisonOp::Between, &json!(5), &json!("1;2;3")).unwrap_err();
        assert!(err.contains("between"), "error: {err}");
    }

    #[test]
    fn between_is_inclusive_and_bound_order_agnostic() {
        assert!(apply_operator(ComparisonOp::Between, &json!(10), &json!("10;20")).unwrap());
        assert!(apply_operator(ComparisonOp::Between, &json!(15), &json!("20;10")).unwrap());
        assert!(!apply_operator(ComparisonOp::Between, &json!(21), &json!("10;20")).unwrap());
    }

    #[test]
    fn null_checks_treat_blank_strings_as_empty() {
        assert!(apply_operator(ComparisonOp::IsNull, &json!("   "), &Value::Null).unwrap());
        assert!(apply_operator(ComparisonOp::IsNotNull, &json!("x"), &Value::Null).unwrap());
    }

    #[test]
    fn from_raw_requires_field_code_for_field_source() {
        let raw = RawCondition {
            source: "field".into(),
            field_code: None,
            operator: "=".into(),
            value: json!("1"),
            stored_procedure_id: None,
            parameter_mapping: vec![],
            result_mapping: vec![],
            selected_result_param: None,
        };
        assert!(RuleCondition::from_raw(raw).is_err());
    }

    #[test]
    fn from_raw_keeps_original_operator_spelling() {
        let raw = RawCondition {
            source: "Field".into(),
            field_code: Some("AMOUNT".into()),
            operator: ">".into(),
            value: json!("10000"),
            stored_procedure_id: None,
            parameter_mapping: vec![],
            result_mapping: vec![],
            selected_result_param: None,
        };
        let condition = RuleCondition::from_raw(raw).unwrap();
        assert_eq!(condition.operator_raw, ">");
        assert_eq!(condition.operator, ComparisonOp::GreaterThan);
    }
}
