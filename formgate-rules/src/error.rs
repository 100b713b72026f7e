use thiserror::Error;

/// Errors surfaced by the rule engine to its callers.
///
/// Per-rule evaluation failures never appear here: they are captured in the
/// rule's trace entry and the rule is treated as non-matching. CopyToDocument
/// failures are returned as structured results, not errors. What remains are
/// malformed requests, malformed rule definitions and storage faults.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller supplied a phase literal outside `pre_open` / `pre_submit`.
    #[error("invalid evaluation phase: {0}")]
    InvalidPhase(String),

    /// A rule definition failed to parse into the typed model.
    #[error("rule {rule_id} has an invalid definition: {message}")]
    Configuration { rule_id: i64, message: String },

    /// A computed-field expression references its own field, directly or
    /// through a chain of other computed fields.
    #[error("field {field_code} participates in a computed-field reference cycle: {chain}")]
    FieldCircularReference { field_code: String, chain: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn configuration(rule_id: i64, message: impl Into<String>) -> Self {
        EngineError::Configuration {
            rule_id,
            message: message.into(),
        }
    }
}

/// Errors produced by the storage collaborators (catalogs, repositories,
/// document stores, procedure invokers).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    DocumentNotFound(i64),

    #[error("submission {0} not found")]
    SubmissionNotFound(i64),

    #[error("rule {0} not found")]
    RuleNotFound(i64),

    #[error("stored procedure {0} is not whitelisted")]
    NotWhitelisted(i64),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}
