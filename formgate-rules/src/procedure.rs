use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::condition::EvaluationContext;
use crate::error::StoreError;

/// Procedure-sourced condition configuration, validated at rule-load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredProcedureSpec {
    pub procedure_id: i64,
    /// Input parameters, bound in declared order.
    #[serde(default)]
    pub parameter_mapping: Vec<ParameterBinding>,
    /// Maps procedure output names to the logical names conditions refer to.
    #[serde(default)]
    pub result_mapping: Vec<ResultBinding>,
    /// Logical name of the output the operator is applied to.
    #[serde(default)]
    pub selected_result_param: Option<String>,
}

/// Binds one procedure input parameter to a field value or a literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterBinding {
    pub parameter: String,
    #[serde(flatten)]
    pub source: ParameterSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    /// Resolve the parameter from a submitted field value. A field without a
    /// submitted value binds SQL null.
    Field(String),
    /// Bind the literal as-is.
    Literal(Value),
}

/// Maps a procedure output column or parameter to a logical result name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultBinding {
    pub source: String,
    pub target: String,
}

/// A whitelisted procedure the engine is allowed to invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureDescriptor {
    pub id: i64,
    pub name: String,
    pub database: String,
}

/// Raw output of one procedure invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcedureOutput {
    /// Named output parameter values.
    #[serde(default)]
    pub output_values: BTreeMap<String, Value>,
    /// Scalar return value, when the procedure produces one.
    #[serde(default)]
    pub return_value: Option<Value>,
    /// First row of the first result set, when the procedure produces one.
    #[serde(default)]
    pub first_row: Option<BTreeMap<String, Value>>,
}

/// Whitelist collaborator. Only procedures it resolves may be invoked;
/// everything else fails closed.
#[async_trait]
pub trait ProcedureWhitelist: Send + Sync {
    async fn lookup(&self, procedure_id: i64) -> Result<Option<ProcedureDescriptor>, StoreError>;
}

/// Executes a whitelisted procedure against its configured database.
#[async_trait]
pub trait ProcedureInvoker: Send + Sync {
    async fn invoke(
        &self,
        descriptor: &ProcedureDescriptor,
        parameters: &[(String, Value)],
    ) -> Result<ProcedureOutput, StoreError>;
}

/// Full invocation detail recorded for debugging, returned only when the
/// caller asked for debug output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureInvocationTrace {
    pub procedure_id: i64,
    pub procedure_name: Option<String>,
    pub database: Option<String>,
    pub parameter_mapping: Vec<ParameterBinding>,
    pub result_mapping: Vec<ResultBinding>,
    pub resolved_parameters: Vec<(String, Value)>,
    pub selected_result_param: Option<String>,
    #[serde(default)]
    pub output_values: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub first_row: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcedureInvocationTrace {
    fn new(spec: &StoredProcedureSpec) -> Self {
        Self {
            procedure_id: spec.procedure_id,
            procedure_name: None,
            database: None,
            parameter_mapping: spec.parameter_mapping.clone(),
            result_mapping: spec.result_mapping.clone(),
            resolved_parameters: Vec::new(),
            selected_result_param: spec.selected_result_param.clone(),
            output_values: None,
            return_value: None,
            first_row: None,
            error: None,
        }
    }
}

/// Outcome of resolving a procedure-sourced condition: the comparison value
/// (when resolution succeeded) and the invocation trace.
#[derive(Debug, Clone)]
pub struct ProcedureResolution {
    pub value: Option<Value>,
    pub trace: ProcedureInvocationTrace,
}

/// Resolves procedure-sourced conditions: whitelist check, parameter
/// binding, bounded invocation, result extraction.
pub struct StoredProcedureConditionResolver {
    whitelist: Arc<dyn ProcedureWhitelist>,
    invoker: Arc<dyn ProcedureInvoker>,
    timeout: Duration,
}

impl StoredProcedureConditionResolver {
    pub fn new(
        whitelist: Arc<dyn ProcedureWhitelist>,
        invoker: Arc<dyn ProcedureInvoker>,
        timeout: Duration,
    ) -> Self {
        Self {
            whitelist,
            invoker,
            timeout,
        }
    }

    /// Resolves the spec into a comparison value. Failures never propagate:
    /// they are recorded on the trace and the condition fails closed.
    pub async fn resolve(
        &self,
        spec: &StoredProcedureSpec,
        ctx: &EvaluationContext,
    ) -> ProcedureResolution {
        let mut trace = ProcedureInvocationTrace::new(spec);

        let descriptor = match self.whitelist.lookup(spec.procedure_id).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                warn!(procedure_id = spec.procedure_id, "stored procedure not whitelisted");
                trace.error = Some(StoreError::NotWhitelisted(spec.procedure_id).to_string());
                return ProcedureResolution { value: None, trace };
            }
            Err(err) => {
                trace.error = Some(format!("whitelist lookup failed: {err}"));
                return ProcedureResolution { value: None, trace };
            }
        };
        trace.procedure_name = Some(descriptor.name.clone());
        trace.database = Some(descriptor.database.clone());

        let parameters: Vec<(String, Value)> = spec
            .parameter_mapping
            .iter()
            .map(|binding| {
                let value = match &binding.source {
                    ParameterSource::Field(code) => {
                        ctx.field_value(code).cloned().unwrap_or(Value::Null)
                    }
                    ParameterSource::Literal(value) => value.clone(),
                };
                (binding.parameter.clone(), value)
            })
            .collect();
        trace.resolved_parameters = parameters.clone();

        let invocation = tokio::time::timeout(
            self.timeout,
            self.invoker.invoke(&descriptor, &parameters),
        )
        .await;

        let output = match invocation {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(procedure = %descriptor.name, error = %err, "stored procedure invocation failed");
                trace.error = Some(format!("invocation failed: {err}"));
                return ProcedureResolution { value: None, trace };
            }
            Err(_) => {
                warn!(procedure = %descriptor.name, timeout_secs = self.timeout.as_secs(), "stored procedure timed out");
                trace.error = Some(format!(
                    "stored procedure `{}` timed out after {}s",
                    descriptor.name,
                    self.timeout.as_secs()
                ));
                return ProcedureResolution { value: None, trace };
            }
        };

        trace.output_values = Some(output.output_values.clone());
        trace.return_value = output.return_value.clone();
        trace.first_row = output.first_row.clone();

        let value = extract_selected_value(spec, &output);
        debug!(
            procedure = %descriptor.name,
            selected = spec.selected_result_param.as_deref().unwrap_or("<first>"),
            resolved = value.is_some(),
            "stored procedure condition resolved"
        );
        ProcedureResolution { value, trace }
    }
}

/// Picks the configured result parameter out of the procedure output: the
/// selected logical name through the result mapping, falling back to the
/// return value and then the first column of the first result row.
fn extract_selected_value(spec: &StoredProcedureSpec, output: &ProcedureOutput) -> Option<Value> {
    let lookup = |source: &str| -> Option<Value> {
        output
            .output_values
            .get(source)
            .or_else(|| output.first_row.as_ref().and_then(|row| row.get(source)))
            .cloned()
    };

    if let Some(selected) = &spec.selected_result_param {
        let source = spec
            .result_mapping
            .iter()
            .find(|binding| &binding.target == selected)
            .map(|binding| binding.source.as_str())
            .unwrap_or(selected.as_str());
        if let Some(value) = lookup(source) {
            return Some(value);
        }
    } else if let Some(binding) = spec.result_mapping.first() {
        if let Some(value) = lookup(&binding.source) {
            return Some(value);
        }
    }

    if let Some(value) = &output.return_value {
        return Some(value.clone());
    }
    output
        .first_row
        .as_ref()
        .and_then(|row| row.values().next().cloned())
}
