//! Blocking-rule engine for dynamic forms.
//!
//! Administrators attach declarative rules to forms. Rules gate whether a
//! form may be opened or submitted, drive field-level behavior (visibility,
//! read-only, mandatory, defaults, computed values), and can duplicate data
//! from one document into another. Rule definitions, field values and
//! documents live with external repository collaborators; this crate owns
//! the evaluation and copy semantics.

pub mod action;
pub mod catalog;
pub mod compute;
pub mod condition;
pub mod copy;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod postgres;
pub mod procedure;
pub mod rule;
pub mod service;

pub use action::{RawAction, RuleAction};
pub use catalog::{FieldValueRepository, InMemoryRuleCatalog, RuleCatalog, RuleRevision};
pub use compute::{validate_field_definitions, FieldDefinition};
pub use condition::{
    ComparisonOp, ConditionEvaluator, ConditionSource, EvaluationContext, RawCondition,
    RuleCondition,
};
pub use copy::{
    AuditSink, CopyToDocumentConfig, CopyToDocumentExecutor, CopyToDocumentResult, DocumentStore,
    FieldMapping, GridMapping, TracingAuditSink, WorkflowTrigger,
};
pub use engine::{ActionExecutor, BlockingRuleEvaluator, EvaluationRequest};
pub use error::{EngineError, StoreError};
pub use outcome::{
    BlockingRuleDebugInfo, BlockingRuleResult, FieldState, FieldStateMap, FieldValidationError,
    FormValidationResult, RuleEvaluationInfo, RuleEvaluationOutcome,
};
pub use procedure::{
    ProcedureDescriptor, ProcedureInvocationTrace, ProcedureInvoker, ProcedureWhitelist,
    StoredProcedureConditionResolver,
};
pub use rule::{EvaluationPhase, RawRule, Rule};
pub use service::{EngineApiBuilder, EngineServiceConfig};
