use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::copy::CopyToDocumentConfig;

/// Declarative action triggered when a rule's condition matches (or, for the
/// ELSE list, does not match).
///
/// A closed union over exactly the eight supported kinds: unknown tags are
/// rejected when the raw row is parsed, never at execution time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Show or hide the target field.
    SetVisible { field_code: String, visible: bool },
    /// Toggle the target field's read-only flag.
    SetReadOnly { field_code: String, read_only: bool },
    /// Toggle the target field's mandatory flag.
    SetMandatory { field_code: String, mandatory: bool },
    /// Set a default value, applied only while the field has no submitted
    /// value.
    SetDefault { field_code: String, value: Value },
    /// Remove the field's current value from the state.
    ClearValue { field_code: String },
    /// Write the result of an arithmetic expression into the target field.
    Compute { field_code: String, expression: String },
    /// Stop the enclosing blocking-rule phase with an optional message.
    Block { message: Option<String> },
    /// Duplicate data from a source document into a target document.
    CopyToDocument {
        /// Identifier of the authored action row, echoed on the copy result.
        action_id: Option<i64>,
        config: Box<CopyToDocumentConfig>,
    },
}

impl RuleAction {
    /// Parses a raw storage row into a typed action.
    ///
    /// The CopyToDocument configuration is decoded eagerly here. The
    /// authoring tables keep it as a JSON string inside the generic value
    /// column, and deferring the decode would let a malformed config hide
    /// until execution.
    pub fn from_raw(raw: RawAction) -> Result<Self, String> {
        let tag = raw
            .action_type
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' ', '_'], "");

        let field_code = |raw: &RawAction| -> Result<String, String> {
            raw.field_code
                .clone()
                .filter(|code| !code.trim().is_empty())
                .ok_or_else(|| format!("action `{}` requires a field code", raw.action_type))
        };

        match tag.as_str() {
            "setvisible" => Ok(RuleAction::SetVisible {
                field_code: field_code(&raw)?,
                visible: parse_flag(&raw)?,
            }),
            "setreadonly" => Ok(RuleAction::SetReadOnly {
                field_code: field_code(&raw)?,
                read_only: parse_flag(&raw)?,
            }),
            "setmandatory" => Ok(RuleAction::SetMandatory {
                field_code: field_code(&raw)?,
                mandatory: parse_flag(&raw)?,
            }),
            "setdefault" => {
                let value = raw
                    .value
                    .clone()
                    .ok_or("set_default requires a value")?;
                Ok(RuleAction::SetDefault {
                    field_code: field_code(&raw)?,
                    value,
                })
            }
            "clearvalue" => Ok(RuleAction::ClearValue {
                field_code: field_code(&raw)?,
            }),
            "compute" => {
                let expression = raw
                    .expression
                    .clone()
                    .filter(|expr| !expr.trim().is_empty())
                    .ok_or("compute requires an expression")?;
                Ok(RuleAction::Compute {
                    field_code: field_code(&raw)?,
                    expression,
                })
            }
            "block" => {
                let message = match &raw.value {
                    None | Some(Value::Null) => None,
                    Some(Value::String(text)) => Some(text.clone()),
                    Some(other) => {
                        return Err(format!("block message must be a string, got `{other}`"))
                    }
                };
                Ok(RuleAction::Block { message })
            }
            "copytodocument" => {
                let value = raw
                    .value
                    .clone()
                    .ok_or("copy_to_document requires a serialized configuration")?;
                let config: CopyToDocumentConfig = match value {
                    Value::String(text) => serde_json::from_str(&text)
                        .map_err(|err| format!("invalid copy_to_document configuration: {err}"))?,
                    other => serde_json::from_value(other)
                        .map_err(|err| format!("invalid copy_to_document configuration: {err}"))?,
                };
                config.validate()?;
                Ok(RuleAction::CopyToDocument {
                    action_id: raw.id,
                    config: Box::new(config),
                })
            }
            _ => Err(format!("unknown action type `{}`", raw.action_type)),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, RuleAction::Block { .. })
    }
}

/// Boolean payload of the three flag actions. A missing value means `true`,
/// matching how the authoring UI persists the common case.
fn parse_flag(raw: &RawAction) -> Result<bool, String> {
    match &raw.value {
        None | Some(Value::Null) => Ok(true),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(format!("`{other}` is not a boolean flag")),
        },
        Some(Value::Number(number)) => match number.as_f64() {
            Some(n) if n == 0.0 => Ok(false),
            Some(_) => Ok(true),
            None => Err("numeric flag out of range".to_string()),
        },
        Some(other) => Err(format!("`{other}` is not a boolean flag")),
    }
}

/// Storage shape of an action row: a string tag plus a polymorphic value
/// column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub field_code: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub expression: Option<String>,
}
