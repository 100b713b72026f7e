use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::condition::is_empty_value;
use crate::error::StoreError;

fn default_initial_status() -> String {
    "Draft".to_string()
}

/// One source-to-target field pair. Mapping entries keep their declared
/// order because copy order is observable in audit trails; keys must be
/// unique within a mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

/// One source-to-target grid pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridMapping {
    pub source: String,
    pub target: String,
}

/// Configuration of a CopyToDocument action, decoded eagerly at rule-load
/// time from the JSON the authoring tables embed in the action's value
/// column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyToDocumentConfig {
    /// Source document type; explicit, never inferred.
    pub source_document_type_id: i64,
    /// Source form; explicit, never inferred.
    pub source_form_id: i64,
    /// Defaults to the submission that triggered evaluation.
    #[serde(default)]
    pub source_submission_id: Option<i64>,
    pub target_document_type_id: i64,
    pub target_form_id: i64,
    #[serde(default)]
    pub create_new_document: bool,
    /// Initial status for a newly created target.
    #[serde(default = "default_initial_status")]
    pub initial_status: String,
    /// Required when not creating a new document.
    #[serde(default)]
    pub target_document_id: Option<i64>,
    #[serde(default)]
    pub field_mapping: Vec<FieldMapping>,
    #[serde(default)]
    pub grid_mapping: Vec<GridMapping>,
    #[serde(default)]
    pub copy_calculated_fields: bool,
    #[serde(default)]
    pub copy_grid_rows: bool,
    #[serde(default)]
    pub start_workflow: bool,
    /// Sets a parent-document back-reference on the target: a non-owning
    /// relational pointer, never structural ownership.
    #[serde(default)]
    pub link_documents: bool,
    #[serde(default)]
    pub copy_metadata: bool,
    /// Whitelist of metadata field names; nothing outside it is copied.
    #[serde(default)]
    pub metadata_fields: Vec<String>,
    #[serde(default)]
    pub copy_attachments: bool,
    /// If true, a non-empty source value always overwrites a target default;
    /// if false, a target default is preserved whenever the mapped source
    /// value is empty.
    #[serde(default)]
    pub override_target_defaults: bool,
}

impl CopyToDocumentConfig {
    /// Structural validation run at rule-load time.
    pub fn validate(&self) -> Result<(), String> {
        if !self.create_new_document && self.target_document_id.is_none() {
            return Err(
                "copy_to_document requires a target document id when not creating a new document"
                    .to_string(),
            );
        }
        check_unique(self.field_mapping.iter().map(|m| m.source.as_str()), "field mapping")?;
        check_unique(self.grid_mapping.iter().map(|m| m.source.as_str()), "grid mapping")?;
        Ok(())
    }
}

fn check_unique<'a>(keys: impl Iterator<Item = &'a str>, label: &str) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(format!("duplicate {label} key `{key}`"));
        }
    }
    Ok(())
}

/// One field value as stored on a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    pub field_code: String,
    pub value: Value,
    /// Whether the value was produced by a calculation rather than typed in.
    #[serde(default)]
    pub calculated: bool,
}

/// One grid row; cell codes are unique within a row, order-irrelevant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GridRow {
    pub cells: BTreeMap<String, Value>,
}

/// All rows of one grid, in stored order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridData {
    pub grid_code: String,
    pub rows: Vec<GridRow>,
}

/// Reference to an uploaded attachment. Whether duplication copies file
/// bytes or only the reference is the storage collaborator's decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRef {
    pub id: i64,
    pub field_code: String,
    pub file_name: String,
}

/// Everything the executor needs to read from a source submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionSnapshot {
    pub submission_id: i64,
    pub document_id: i64,
    pub field_values: Vec<FieldValue>,
    #[serde(default)]
    pub grids: Vec<GridData>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl SubmissionSnapshot {
    fn field(&self, code: &str) -> Option<&FieldValue> {
        self.field_values.iter().find(|value| value.field_code == code)
    }
}

/// Target of a copy: a document to create or an existing one to update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CopyTarget {
    CreateNew {
        document_type_id: i64,
        form_id: i64,
        initial_status: String,
    },
    Existing {
        document_id: i64,
    },
}

/// One grid's worth of rows to write, already remapped to target codes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridWrite {
    pub grid_code: String,
    pub rows: Vec<GridRow>,
}

/// The fully resolved set of writes one copy will perform. The store commits
/// it as a single unit: either everything lands or nothing does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPlan {
    pub target: CopyTarget,
    pub source_document_id: i64,
    /// Field writes in mapping-declaration order.
    pub field_writes: Vec<(String, Value)>,
    pub grid_writes: Vec<GridWrite>,
    pub metadata_writes: Vec<(String, Value)>,
    pub attachments: Vec<AttachmentRef>,
    /// When set, the store writes a parent-document back-reference to this
    /// source document id on the target.
    pub link_source_document_id: Option<i64>,
}

/// What the store reports back after an atomic commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyCommit {
    pub document_id: i64,
    pub document_number: String,
}

/// Outcome of one CopyToDocument execution. Constructed once per action
/// execution, handed to the caller and the audit sink, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyToDocumentResult {
    /// Correlation id for audit and log lookups.
    pub copy_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub target_document_id: Option<i64>,
    #[serde(default)]
    pub target_document_number: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub fields_copied: usize,
    pub grid_rows_copied: usize,
    #[serde(default)]
    pub action_id: Option<i64>,
    #[serde(default)]
    pub source_submission_id: Option<i64>,
}

impl CopyToDocumentResult {
    fn failure(action_id: Option<i64>, source_submission_id: Option<i64>, message: String) -> Self {
        Self {
            copy_id: Uuid::new_v4(),
            success: false,
            target_document_id: None,
            target_document_number: None,
            error_message: Some(message),
            fields_copied: 0,
            grid_rows_copied: 0,
            action_id,
            source_submission_id,
        }
    }
}

/// Document and grid storage collaborator. `commit_copy` must be atomic:
/// a failure mid-commit leaves a created target rolled back and an existing
/// target unchanged. Concurrent commits into the same target document must
/// be serialized by the implementation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_submission(
        &self,
        submission_id: i64,
    ) -> Result<Option<SubmissionSnapshot>, StoreError>;

    /// Current field values of a document, or `None` when the document does
    /// not exist.
    async fn document_field_values(
        &self,
        document_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>, StoreError>;

    async fn commit_copy(&self, plan: &CopyPlan) -> Result<CopyCommit, StoreError>;
}

/// Approval-workflow runtime collaborator.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn start_workflow(&self, document_id: i64) -> Result<(), StoreError>;
}

/// Sink for CopyToDocument outcomes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_copy(&self, result: &CopyToDocumentResult);
}

/// Default audit sink: structured tracing events only.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_copy(&self, result: &CopyToDocumentResult) {
        if result.success {
            info!(
                copy_id = %result.copy_id,
                target_document_id = result.target_document_id,
                fields_copied = result.fields_copied,
                grid_rows_copied = result.grid_rows_copied,
                "copy_to_document succeeded"
            );
        } else {
            warn!(
                copy_id = %result.copy_id,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "copy_to_document failed"
            );
        }
    }
}

/// Duplicates field and grid data from a source document into a new or
/// existing target document, as one atomic unit of work.
pub struct CopyToDocumentExecutor {
    store: Arc<dyn DocumentStore>,
    workflow: Arc<dyn WorkflowTrigger>,
    audit: Arc<dyn AuditSink>,
}

impl CopyToDocumentExecutor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        workflow: Arc<dyn WorkflowTrigger>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            workflow,
            audit,
        }
    }

    /// Executes one copy. Never returns an error: every failure mode ends up
    /// as a structured failure result with no visible partial effect.
    pub async fn execute(
        &self,
        config: &CopyToDocumentConfig,
        action_id: Option<i64>,
        triggering_submission_id: Option<i64>,
    ) -> CopyToDocumentResult {
        let source_submission_id = config.source_submission_id.or(triggering_submission_id);
        let result = self
            .try_execute(config, action_id, source_submission_id)
            .await
            .unwrap_or_else(|message| {
                CopyToDocumentResult::failure(action_id, source_submission_id, message)
            });
        self.audit.record_copy(&result).await;
        result
    }

    async fn try_execute(
        &self,
        config: &CopyToDocumentConfig,
        action_id: Option<i64>,
        source_submission_id: Option<i64>,
    ) -> Result<CopyToDocumentResult, String> {
        let submission_id =
            source_submission_id.ok_or("no source submission available for copy")?;

        let snapshot = self
            .store
            .load_submission(submission_id)
            .await
            .map_err(|err| format!("failed to load source submission: {err}"))?
            .ok_or_else(|| StoreError::SubmissionNotFound(submission_id).to_string())?;

        let (target, target_values) = if config.create_new_document {
            (
                CopyTarget::CreateNew {
                    document_type_id: config.target_document_type_id,
                    form_id: config.target_form_id,
                    initial_status: config.initial_status.clone(),
                },
                BTreeMap::new(),
            )
        } else {
            let document_id = config
                .target_document_id
                .ok_or("copy_to_document has no target document id")?;
            let values = self
                .store
                .document_field_values(document_id)
                .await
                .map_err(|err| format!("failed to load target document: {err}"))?
                .ok_or_else(|| StoreError::DocumentNotFound(document_id).to_string())?;
            (CopyTarget::Existing { document_id }, values)
        };

        let field_writes = plan_field_writes(config, &snapshot, &target_values);
        let grid_writes = if config.copy_grid_rows {
            plan_grid_writes(config, &snapshot)
        } else {
            Vec::new()
        };
        let metadata_writes = if config.copy_metadata {
            config
                .metadata_fields
                .iter()
                .filter_map(|name| {
                    snapshot
                        .metadata
                        .get(name)
                        .map(|value| (name.clone(), value.clone()))
                })
                .collect()
        } else {
            Vec::new()
        };
        let attachments = if config.copy_attachments {
            snapshot.attachments.clone()
        } else {
            Vec::new()
        };

        let plan = CopyPlan {
            target,
            source_document_id: snapshot.document_id,
            field_writes,
            grid_writes,
            metadata_writes,
            attachments,
            link_source_document_id: config.link_documents.then_some(snapshot.document_id),
        };

        let fields_copied = plan.field_writes.len();
        let grid_rows_copied = plan.grid_writes.iter().map(|write| write.rows.len()).sum();

        let commit = self
            .store
            .commit_copy(&plan)
            .await
            .map_err(|err| format!("copy commit failed: {err}"))?;

        debug!(
            document_id = commit.document_id,
            fields_copied, grid_rows_copied, "copy plan committed"
        );

        if config.start_workflow {
            // Fire-and-forget relative to the copy's own success.
            if let Err(err) = self.workflow.start_workflow(commit.document_id).await {
                warn!(
                    document_id = commit.document_id,
                    error = %err,
                    "workflow start failed after successful copy"
                );
            }
        }

        Ok(CopyToDocumentResult {
            copy_id: Uuid::new_v4(),
            success: true,
            target_document_id: Some(commit.document_id),
            target_document_number: Some(commit.document_number),
            error_message: None,
            fields_copied,
            grid_rows_copied,
            action_id,
            source_submission_id: Some(submission_id),
        })
    }
}

/// Resolves the field mapping against source and target values. A write
/// happens when the source value is non-empty and either overriding is on or
/// the target has no current value.
fn plan_field_writes(
    config: &CopyToDocumentConfig,
    snapshot: &SubmissionSnapshot,
    target_values: &BTreeMap<String, Value>,
) -> Vec<(String, Value)> {
    let mut writes = Vec::new();
    for mapping in &config.field_mapping {
        let Some(source) = snapshot.field(&mapping.source) else {
            continue;
        };
        if source.calculated && !config.copy_calculated_fields {
            continue;
        }
        if is_empty_value(Some(&source.value)) {
            continue;
        }
        let target_occupied = !is_empty_value(target_values.get(&mapping.target));
        if target_occupied && !config.override_target_defaults {
            continue;
        }
        writes.push((mapping.target.clone(), source.value.clone()));
    }
    writes
}

/// Duplicates grid rows per the grid mapping, remapping cell codes through
/// the field mapping. Row order is preserved; cells without a mapping entry
/// keep their code.
fn plan_grid_writes(config: &CopyToDocumentConfig, snapshot: &SubmissionSnapshot) -> Vec<GridWrite> {
    let cell_target = |code: &str| -> String {
        config
            .field_mapping
            .iter()
            .find(|mapping| mapping.source == code)
            .map(|mapping| mapping.target.clone())
            .unwrap_or_else(|| code.to_string())
    };

    let mut writes = Vec::new();
    for mapping in &config.grid_mapping {
        let Some(grid) = snapshot
            .grids
            .iter()
            .find(|grid| grid.grid_code == mapping.source)
        else {
            continue;
        };
        let rows = grid
            .rows
            .iter()
            .map(|row| GridRow {
                cells: row
                    .cells
                    .iter()
                    .map(|(code, value)| (cell_target(code), value.clone()))
                    .collect(),
            })
            .collect();
        writes.push(GridWrite {
            grid_code: mapping.target.clone(),
            rows,
        });
    }
    writes
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory document store used across the engine's unit tests. Commits
    /// are all-or-nothing: a configured failure leaves state untouched.
    #[derive(Default)]
    pub struct InMemoryDocumentStore {
        pub submissions: Mutex<BTreeMap<i64, SubmissionSnapshot>>,
        pub documents: Mutex<BTreeMap<i64, BTreeMap<String, Value>>>,
        pub committed_plans: Mutex<Vec<CopyPlan>>,
        pub fail_commit: Mutex<Option<String>>,
        pub next_document_id: Mutex<i64>,
    }

    impl InMemoryDocumentStore {
        pub fn new() -> Self {
            Self {
                next_document_id: Mutex::new(1000),
                ..Self::default()
            }
        }

        pub fn with_submission(self, snapshot: SubmissionSnapshot) -> Self {
            self.submissions.lock().insert(snapshot.submission_id, snapshot);
            self
        }

        pub fn with_document(self, document_id: i64, values: BTreeMap<String, Value>) -> Self {
            self.documents.lock().insert(document_id, values);
            self
        }
    }

    #[async_trait]
    impl DocumentStore for InMemoryDocumentStore {
        async fn load_submission(
            &self,
            submission_id: i64,
        ) -> Result<Option<SubmissionSnapshot>, StoreError> {
            Ok(self.submissions.lock().get(&submission_id).cloned())
        }

        async fn document_field_values(
            &self,
            document_id: i64,
        ) -> Result<Option<BTreeMap<String, Value>>, StoreError> {
            Ok(self.documents.lock().get(&document_id).cloned())
        }

        async fn commit_copy(&self, plan: &CopyPlan) -> Result<CopyCommit, StoreError> {
            if let Some(message) = self.fail_commit.lock().clone() {
                return Err(StoreError::Database(message));
            }

            let document_id = match &plan.target {
                CopyTarget::CreateNew { .. } => {
                    let mut next = self.next_document_id.lock();
                    *next += 1;
                    *next
                }
                CopyTarget::Existing { document_id } => *document_id,
            };

            let mut documents = self.documents.lock();
            let values = documents.entry(document_id).or_default();
            for (code, value) in &plan.field_writes {
                values.insert(code.clone(), value.clone());
            }
            if let Some(source_id) = plan.link_source_document_id {
                values.insert("__parent_document_id".to_string(), Value::from(source_id));
            }
            drop(documents);

            self.committed_plans.lock().push(plan.clone());
            Ok(CopyCommit {
                document_id,
                document_number: format!("DOC-{document_id:06}"),
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingWorkflow {
        pub started: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl WorkflowTrigger for RecordingWorkflow {
        async fn start_workflow(&self, document_id: i64) -> Result<(), StoreError> {
            self.started.lock().push(document_id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingAudit {
        pub records: Mutex<Vec<CopyToDocumentResult>>,
    }

    #[async_trait]
    impl AuditSink for RecordingAudit {
        async fn record_copy(&self, result: &CopyToDocumentResult) {
            self.records.lock().push(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn base_config() -> CopyToDocumentConfig {
        CopyToDocumentConfig {
            source_document_type_id: 1,
            source_form_id: 10,
            source_submission_id: None,
            target_document_type_id: 2,
            target_form_id: 20,
            create_new_document: true,
            initial_status: default_initial_status(),
            target_document_id: None,
            field_mapping: vec![FieldMapping {
                source: "TOTAL".into(),
                target: "CONTRACT_VALUE".into(),
            }],
            grid_mapping: Vec::new(),
            copy_calculated_fields: false,
            copy_grid_rows: false,
            start_workflow: false,
            link_documents: false,
            copy_metadata: false,
            metadata_fields: Vec::new(),
            copy_attachments: false,
            override_target_defaults: false,
        }
    }

    fn snapshot() -> SubmissionSnapshot {
        SubmissionSnapshot {
            submission_id: 77,
            document_id: 500,
            field_values: vec![FieldValue {
                field_code: "TOTAL".into(),
                value: json!(200),
                calculated: false,
            }],
            grids: Vec::new(),
            metadata: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    fn executor(store: Arc<InMemoryDocumentStore>) -> (CopyToDocumentExecutor, Arc<RecordingAudit>) {
        let audit = Arc::new(RecordingAudit::default());
        (
            CopyToDocumentExecutor::new(store, Arc::new(RecordingWorkflow::default()), audit.clone()),
            audit,
        )
    }

    #[tokio::test]
    async fn copies_mapped_field_into_new_document() {
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(snapshot()));
        let (executor, audit) = executor(store.clone());

        let result = executor.execute(&base_config(), Some(9), Some(77)).await;

        assert!(result.success, "error: {:?}", result.error_message);
        assert_eq!(result.fields_copied, 1);
        assert_eq!(result.grid_rows_copied, 0);
        assert_eq!(result.action_id, Some(9));
        assert_eq!(result.source_submission_id, Some(77));
        let document_id = result.target_document_id.expect("created document");
        let values = store.documents.lock().get(&document_id).cloned().unwrap();
        assert_eq!(values.get("CONTRACT_VALUE"), Some(&json!(200)));
        assert_eq!(audit.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn preserved_target_default_when_source_empty_and_override_off() {
        let store = Arc::new(
            InMemoryDocumentStore::new()
                .with_submission(SubmissionSnapshot {
                    field_values: vec![FieldValue {
                        field_code: "TOTAL".into(),
                        value: json!(""),
                        calculated: false,
                    }],
                    ..snapshot()
                })
                .with_document(600, [("CONTRACT_VALUE".to_string(), json!(9_999))].into_iter().collect()),
        );
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.create_new_document = false;
        config.target_document_id = Some(600);

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(result.success);
        assert_eq!(result.fields_copied, 0);
        let values = store.documents.lock().get(&600).cloned().unwrap();
        assert_eq!(values.get("CONTRACT_VALUE"), Some(&json!(9_999)));
    }

    #[tokio::test]
    async fn override_takes_non_empty_source_over_existing_default() {
        let store = Arc::new(
            InMemoryDocumentStore::new()
                .with_submission(snapshot())
                .with_document(600, [("CONTRACT_VALUE".to_string(), json!(9_999))].into_iter().collect()),
        );
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.create_new_document = false;
        config.target_document_id = Some(600);
        config.override_target_defaults = true;

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(result.success);
        assert_eq!(result.fields_copied, 1);
        let values = store.documents.lock().get(&600).cloned().unwrap();
        assert_eq!(values.get("CONTRACT_VALUE"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn calculated_fields_are_skipped_unless_enabled() {
        let mut source = snapshot();
        source.field_values[0].calculated = true;
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(source));
        let (executor, _) = executor(store.clone());

        let result = executor.execute(&base_config(), None, Some(77)).await;
        assert!(result.success);
        assert_eq!(result.fields_copied, 0);

        let mut config = base_config();
        config.copy_calculated_fields = true;
        let result = executor.execute(&config, None, Some(77)).await;
        assert_eq!(result.fields_copied, 1);
    }

    #[tokio::test]
    async fn grid_rows_are_remapped_and_counted_in_order() {
        let mut source = snapshot();
        source.grids = vec![GridData {
            grid_code: "LINES".into(),
            rows: vec![
                GridRow {
                    cells: [("TOTAL".to_string(), json!(10)), ("QTY".to_string(), json!(1))]
                        .into_iter()
                        .collect(),
                },
                GridRow {
                    cells: [("TOTAL".to_string(), json!(20)), ("QTY".to_string(), json!(2))]
                        .into_iter()
                        .collect(),
                },
            ],
        }];
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(source));
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.copy_grid_rows = true;
        config.grid_mapping = vec![GridMapping {
            source: "LINES".into(),
            target: "CONTRACT_LINES".into(),
        }];

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(result.success);
        assert_eq!(result.grid_rows_copied, 2);

        let plans = store.committed_plans.lock();
        let write = &plans[0].grid_writes[0];
        assert_eq!(write.grid_code, "CONTRACT_LINES");
        assert_eq!(write.rows[0].cells.get("CONTRACT_VALUE"), Some(&json!(10)));
        assert_eq!(write.rows[1].cells.get("QTY"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn commit_failure_leaves_target_unchanged() {
        let store = Arc::new(
            InMemoryDocumentStore::new()
                .with_submission(snapshot())
                .with_document(600, [("CONTRACT_VALUE".to_string(), json!(1))].into_iter().collect()),
        );
        *store.fail_commit.lock() = Some("grid insert failed".to_string());
        let (executor, audit) = executor(store.clone());

        let mut config = base_config();
        config.create_new_document = false;
        config.target_document_id = Some(600);
        config.override_target_defaults = true;

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("grid insert failed"));
        assert_eq!(result.fields_copied, 0);

        let values = store.documents.lock().get(&600).cloned().unwrap();
        assert_eq!(values.get("CONTRACT_VALUE"), Some(&json!(1)));
        assert!(!audit.records.lock()[0].success);
    }

    #[tokio::test]
    async fn missing_target_document_fails_without_writes() {
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(snapshot()));
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.create_new_document = false;
        config.target_document_id = Some(999);

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(!result.success);
        assert!(result.error_message.as_deref().unwrap().contains("999"));
        assert!(store.committed_plans.lock().is_empty());
    }

    #[tokio::test]
    async fn metadata_copy_honors_the_whitelist() {
        let mut source = snapshot();
        source.metadata = [
            ("owner".to_string(), json!("alice")),
            ("secret".to_string(), json!("hidden")),
        ]
        .into_iter()
        .collect();
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(source));
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.copy_metadata = true;
        config.metadata_fields = vec!["owner".to_string()];

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(result.success);
        let plans = store.committed_plans.lock();
        assert_eq!(plans[0].metadata_writes, vec![("owner".to_string(), json!("alice"))]);
    }

    #[tokio::test]
    async fn link_documents_records_source_back_reference() {
        let store = Arc::new(InMemoryDocumentStore::new().with_submission(snapshot()));
        let (executor, _) = executor(store.clone());

        let mut config = base_config();
        config.link_documents = true;
        config.start_workflow = true;

        let result = executor.execute(&config, None, Some(77)).await;
        assert!(result.success);
        let plans = store.committed_plans.lock();
        assert_eq!(plans[0].link_source_document_id, Some(500));
    }

    #[test]
    fn validate_rejects_duplicate_mapping_keys() {
        let mut config = base_config();
        config.field_mapping.push(FieldMapping {
            source: "TOTAL".into(),
            target: "OTHER".into(),
        });
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn validate_requires_target_id_for_updates() {
        let mut config = base_config();
        config.create_new_document = false;
        config.target_document_id = None;
        assert!(config.validate().is_err());
    }
}
