use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::action::RuleAction;
use crate::catalog::{FieldValueRepository, RuleCatalog};
use crate::compute;
use crate::condition::{ConditionEvaluator, EvaluationContext};
use crate::copy::{CopyToDocumentExecutor, CopyToDocumentResult};
use crate::error::EngineError;
use crate::outcome::{
    BlockingRuleDebugInfo, BlockingRuleResult, FieldStateMap, FieldValidationError,
    FormValidationResult, RuleEvaluationInfo, RuleEvaluationOutcome,
};
use crate::procedure::StoredProcedureConditionResolver;
use crate::rule::EvaluationPhase;

/// Payload of one EvaluateBlockingRules call.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub form_id: i64,
    pub phase: EvaluationPhase,
    pub submission_id: Option<i64>,
    pub field_values: BTreeMap<String, Value>,
    pub include_debug_info: bool,
}

/// What applying one action did.
#[derive(Debug)]
pub enum ActionEffect {
    Applied,
    Blocked { message: Option<String> },
    Failed(String),
}

/// Dispatches on action type and mutates the field-state map, or delegates
/// to the CopyToDocument executor. All mutation is in-memory except
/// CopyToDocument, which performs external writes.
pub struct ActionExecutor {
    copier: Arc<CopyToDocumentExecutor>,
}

impl ActionExecutor {
    pub fn new(copier: Arc<CopyToDocumentExecutor>) -> Self {
        Self { copier }
    }

    /// Applies one action in place. Field-state actions mutate `states`;
    /// CopyToDocument appends its result to `copies`.
    pub async fn apply(
        &self,
        action: &RuleAction,
        states: &mut FieldStateMap,
        ctx: &EvaluationContext,
        copies: &mut Vec<CopyToDocumentResult>,
    ) -> ActionEffect {
        match action {
            RuleAction::SetVisible { field_code, visible } => {
                states.set_visible(field_code, *visible);
                ActionEffect::Applied
            }
            RuleAction::SetReadOnly { field_code, read_only } => {
                states.set_read_only(field_code, *read_only);
                ActionEffect::Applied
            }
            RuleAction::SetMandatory { field_code, mandatory } => {
                states.set_mandatory(field_code, *mandatory);
                ActionEffect::Applied
            }
            RuleAction::SetDefault { field_code, value } => {
                states.set_default(field_code, value.clone());
                ActionEffect::Applied
            }
            RuleAction::ClearValue { field_code } => {
                states.clear_value(field_code);
                ActionEffect::Applied
            }
            RuleAction::Compute { field_code, expression } => {
                let lookup = |code: &str| states.numeric_value(code);
                match compute::evaluate(expression, &lookup) {
                    Ok(result) => {
                        states.set_computed(field_code, Value::from(result));
                        ActionEffect::Applied
                    }
                    Err(message) => ActionEffect::Failed(format!(
                        "compute for `{field_code}` failed: {message}"
                    )),
                }
            }
            RuleAction::Block { message } => ActionEffect::Blocked {
                message: message.clone(),
            },
            RuleAction::CopyToDocument { action_id, config } => {
                let result = self
                    .copier
                    .execute(config, *action_id, ctx.submission_id)
                    .await;
                let failed = (!result.success).then(|| {
                    result
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "copy_to_document failed".to_string())
                });
                copies.push(result);
                match failed {
                    Some(message) => ActionEffect::Failed(message),
                    None => ActionEffect::Applied,
                }
            }
        }
    }
}

/// Orchestrates phase-scoped rule evaluation and aggregates block decisions.
///
/// Production calls stop at the first block; debug calls evaluate every rule
/// and report the first block inside the full trace. The two code paths are
/// deliberately kept side by side in the same loop rather than sharing
/// short-circuit logic.
///
/// The evaluator holds no shared mutable state, so concurrent evaluations
/// are fully independent and an evaluation future can simply be dropped when
/// the originating request is aborted.
pub struct BlockingRuleEvaluator {
    catalog: Arc<dyn RuleCatalog>,
    resolver: StoredProcedureConditionResolver,
    executor: ActionExecutor,
    field_values: Option<Arc<dyn FieldValueRepository>>,
}

impl BlockingRuleEvaluator {
    pub fn new(
        catalog: Arc<dyn RuleCatalog>,
        resolver: StoredProcedureConditionResolver,
        copier: Arc<CopyToDocumentExecutor>,
    ) -> Self {
        Self {
            catalog,
            resolver,
            executor: ActionExecutor::new(copier),
            field_values: None,
        }
    }

    /// Lets the evaluator read submission values itself when the caller
    /// supplies only a submission id.
    pub fn with_field_value_repository(mut self, repository: Arc<dyn FieldValueRepository>) -> Self {
        self.field_values = Some(repository);
        self
    }

    async fn build_context(&self, request: &EvaluationRequest) -> Result<EvaluationContext, EngineError> {
        let mut field_values = request.field_values.clone();
        if field_values.is_empty() {
            if let (Some(submission_id), Some(repository)) =
                (request.submission_id, self.field_values.as_ref())
            {
                if let Some(stored) = repository.submission_values(submission_id).await? {
                    field_values = stored;
                }
            }
        }
        Ok(EvaluationContext {
            form_id: request.form_id,
            submission_id: request.submission_id,
            field_values,
        })
    }

    /// Evaluates the blocking rules of one form and phase.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<BlockingRuleResult, EngineError> {
        let rules = self.catalog.active_rules(request.form_id, request.phase).await?;
        let mut result = BlockingRuleResult::default();
        let mut debug_info = request
            .include_debug_info
            .then(|| BlockingRuleDebugInfo::new(rules.len()));

        if rules.is_empty() {
            if let Some(info) = &mut debug_info {
                info.no_rules_reason = Some(format!(
                    "no active rules configured for form {} in phase {}",
                    request.form_id, request.phase
                ));
            }
            result.debug = debug_info;
            return Ok(result);
        }

        let ctx = self.build_context(request).await?;
        let mut states = FieldStateMap::from_submitted(&ctx.field_values);
        let evaluator = ConditionEvaluator::new(&self.resolver);
        let debug_mode = request.include_debug_info;
        let mut block_found = false;

        for rule in &rules {
            if block_found && !debug_mode {
                break;
            }

            let condition = evaluator.evaluate(&rule.condition, &ctx).await;
            let mut info = RuleEvaluationInfo::for_rule(rule);
            info.matched = condition.matched;
            info.procedure_trace = condition.procedure_trace;

            if let Some(error) = condition.error {
                // Fail closed: the rule neither blocks nor applies actions.
                debug!(rule_id = rule.id, error = %error, "rule condition failed to evaluate");
                info.error = Some(error);
                info.outcome = RuleEvaluationOutcome::Error;
                push_info(&mut debug_info, info);
                continue;
            }

            let (actions, else_branch) = if condition.matched {
                (&rule.actions, false)
            } else {
                (&rule.else_actions, true)
            };

            if actions.is_empty() {
                info.outcome = if condition.matched {
                    RuleEvaluationOutcome::ActionsApplied
                } else {
                    RuleEvaluationOutcome::NotMatched
                };
                push_info(&mut debug_info, info);
                continue;
            }

            if block_found {
                // Debug mode past the first block: trace, but apply nothing,
                // matching what the production path would have run.
                info.outcome = if condition.matched {
                    RuleEvaluationOutcome::MatchedNotApplied
                } else {
                    RuleEvaluationOutcome::NotMatched
                };
                push_info(&mut debug_info, info);
                continue;
            }

            info.outcome = if else_branch {
                RuleEvaluationOutcome::ElseActionsApplied
            } else {
                RuleEvaluationOutcome::ActionsApplied
            };

            for action in actions {
                match self
                    .executor
                    .apply(action, &mut states, &ctx, &mut result.copy_results)
                    .await
                {
                    ActionEffect::Applied => {}
                    ActionEffect::Blocked { message } => {
                        debug!(rule_id = rule.id, "rule blocked the phase");
                        block_found = true;
                        result.blocked = true;
                        result.block_message = message.or_else(|| rule.description.clone());
                        result.matched_rule_id = Some(rule.id);
                        result.matched_rule_name = Some(rule.name.clone());
                        info.outcome = RuleEvaluationOutcome::Blocked;
                        break;
                    }
                    ActionEffect::Failed(message) => {
                        debug!(rule_id = rule.id, error = %message, "action failed");
                        if info.error.is_none() {
                            info.error = Some(message);
                        }
                    }
                }
            }

            push_info(&mut debug_info, info);
        }

        if let Some(info) = &mut debug_info {
            info.rules_evaluated = info.evaluations.len();
        }
        result.debug = debug_info;
        Ok(result)
    }

    /// Evaluates the form's `pre_submit` rules against the supplied values
    /// and returns the resulting field-state map plus validation errors.
    ///
    /// A Block action contributes a validation error instead of cutting the
    /// map build short, and CopyToDocument actions are not executed here:
    /// validation must stay free of external writes.
    pub async fn validate_form(
        &self,
        form_id: i64,
        field_values: BTreeMap<String, Value>,
    ) -> Result<FormValidationResult, EngineError> {
        let rules = self
            .catalog
            .active_rules(form_id, EvaluationPhase::PreSubmit)
            .await?;
        let ctx = EvaluationContext {
            form_id,
            submission_id: None,
            field_values,
        };
        let mut states = FieldStateMap::from_submitted(&ctx.field_values);
        let mut errors = Vec::new();
        let evaluator = ConditionEvaluator::new(&self.resolver);
        let mut copies = Vec::new();

        for rule in &rules {
            let condition = evaluator.evaluate(&rule.condition, &ctx).await;
            if condition.error.is_some() {
                continue;
            }
            let actions = if condition.matched {
                &rule.actions
            } else {
                &rule.else_actions
            };

            for action in actions {
                if matches!(action, RuleAction::CopyToDocument { .. }) {
                    continue;
                }
                match self
                    .executor
                    .apply(action, &mut states, &ctx, &mut copies)
                    .await
                {
                    ActionEffect::Applied => {}
                    ActionEffect::Blocked { message } => {
                        errors.push(FieldValidationError {
                            field_code: None,
                            message: message
                                .or_else(|| rule.description.clone())
                                .unwrap_or_else(|| format!("blocked by rule `{}`", rule.name)),
                        });
                    }
                    ActionEffect::Failed(message) => {
                        errors.push(FieldValidationError {
                            field_code: None,
                            message,
                        });
                    }
                }
            }
        }

        for (code, state) in states.iter() {
            // A field the rules hid cannot be required from the user.
            if state.visible == Some(false) {
                continue;
            }
            if state.mandatory == Some(true)
                && crate::condition::is_empty_value(state.effective_value())
            {
                errors.push(FieldValidationError {
                    field_code: Some(code.clone()),
                    message: format!("field `{code}` is mandatory"),
                });
            }
        }

        Ok(FormValidationResult {
            field_states: states,
            errors,
        })
    }
}

fn push_info(debug_info: &mut Option<BlockingRuleDebugInfo>, info: RuleEvaluationInfo) {
    if let Some(debug_info) = debug_info {
        debug_info.evaluations.push(info);
    }
}
