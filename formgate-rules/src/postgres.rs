//! Postgres-backed implementations of the engine's collaborator traits.
//!
//! Queries are built with runtime binding rather than the compile-time
//! checked macros: the engine is a library and cannot assume a live schema
//! at build time.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use formgate_core::DatabasePool;

use crate::catalog::{FieldValueRepository, RuleCatalog};
use crate::copy::{
    AttachmentRef, CopyCommit, CopyPlan, CopyTarget, DocumentStore, FieldValue, GridData, GridRow,
    SubmissionSnapshot,
};
use crate::error::{EngineError, StoreError};
use crate::procedure::{ProcedureDescriptor, ProcedureInvoker, ProcedureOutput, ProcedureWhitelist};
use crate::rule::{EvaluationPhase, RawRule, Rule};

/// Loads active rules for a form and phase from the authoring tables.
#[derive(Clone)]
pub struct PgRuleCatalog {
    pool: PgPool,
}

impl PgRuleCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_shared_pool(pool: &DatabasePool) -> Self {
        Self::new(pool.inner().clone())
    }
}

#[async_trait]
impl RuleCatalog for PgRuleCatalog {
    async fn active_rules(
        &self,
        form_id: i64,
        phase: EvaluationPhase,
    ) -> Result<Vec<Rule>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, form_id, name, description, phase, priority, enabled,
                   condition, actions, else_actions
            FROM form_rules
            WHERE form_id = $1 AND phase = $2 AND enabled = TRUE AND deleted_at IS NULL
            ORDER BY priority ASC, id ASC
            "#,
        )
        .bind(form_id)
        .bind(phase.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.into_iter().map(decode_rule).collect()
    }
}

fn decode_rule(row: PgRow) -> Result<Rule, EngineError> {
    let id: i64 = row.try_get("id").map_err(StoreError::from)?;
    let raw = RawRule::from_parts(
        id,
        row.try_get("form_id").map_err(StoreError::from)?,
        row.try_get("name").map_err(StoreError::from)?,
        row.try_get("description").map_err(StoreError::from)?,
        row.try_get("phase").map_err(StoreError::from)?,
        row.try_get("priority").map_err(StoreError::from)?,
        row.try_get("enabled").map_err(StoreError::from)?,
        row.try_get("condition").map_err(StoreError::from)?,
        row.try_get::<Option<Value>, _>("actions")
            .map_err(StoreError::from)?
            .unwrap_or(Value::Null),
        row.try_get::<Option<Value>, _>("else_actions")
            .map_err(StoreError::from)?
            .unwrap_or(Value::Null),
    )
    .map_err(|message| EngineError::Configuration { rule_id: id, message })?;

    Rule::from_raw(raw)
}

/// Reads the current field values of a submission.
#[derive(Clone)]
pub struct PgFieldValueRepository {
    pool: PgPool,
}

impl PgFieldValueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FieldValueRepository for PgFieldValueRepository {
    async fn submission_values(
        &self,
        submission_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>, StoreError> {
        let exists = sqlx::query("SELECT id FROM form_submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT field_code, value FROM submission_field_values WHERE submission_id = $1",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;

        let mut values = BTreeMap::new();
        for row in rows {
            let code: String = row.try_get("field_code")?;
            let value: Value = row.try_get("value")?;
            values.insert(code, value);
        }
        Ok(Some(values))
    }
}

/// Whitelist of procedures the engine may invoke, maintained by
/// administrators outside this crate.
#[derive(Clone)]
pub struct PgProcedureWhitelist {
    pool: PgPool,
}

impl PgProcedureWhitelist {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcedureWhitelist for PgProcedureWhitelist {
    async fn lookup(&self, procedure_id: i64) -> Result<Option<ProcedureDescriptor>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, database_name FROM procedure_whitelist WHERE id = $1 AND enabled = TRUE",
        )
        .bind(procedure_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProcedureDescriptor {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                database: row.try_get("database_name")?,
            })
        })
        .transpose()
    }
}

/// Invokes whitelisted procedures. Each configured database gets its own
/// pool; unknown databases fall back to the default pool.
pub struct PgProcedureInvoker {
    default_pool: PgPool,
    pools: HashMap<String, PgPool>,
}

impl PgProcedureInvoker {
    pub fn new(default_pool: PgPool) -> Self {
        Self {
            default_pool,
            pools: HashMap::new(),
        }
    }

    pub fn with_database(mut self, name: impl Into<String>, pool: PgPool) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    fn pool_for(&self, database: &str) -> &PgPool {
        self.pools.get(database).unwrap_or(&self.default_pool)
    }
}

#[async_trait]
impl ProcedureInvoker for PgProcedureInvoker {
    async fn invoke(
        &self,
        descriptor: &ProcedureDescriptor,
        parameters: &[(String, Value)],
    ) -> Result<ProcedureOutput, StoreError> {
        // The procedure name comes from the whitelist row, never from rule
        // input, so interpolating it keeps the fail-closed invariant.
        let placeholders = (1..=parameters.len())
            .map(|index| format!("${index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT to_jsonb(t) AS result FROM {}({}) AS t LIMIT 1",
            descriptor.name, placeholders
        );

        let mut query = sqlx::query_scalar::<_, Value>(&sql);
        for (_, value) in parameters {
            query = match value {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(flag) => query.bind(*flag),
                Value::Number(number) => match number.as_i64() {
                    Some(int) => query.bind(int),
                    None => query.bind(number.as_f64()),
                },
                Value::String(text) => query.bind(text.as_str()),
                other => query.bind(other),
            };
        }

        let first = query
            .fetch_optional(self.pool_for(&descriptor.database))
            .await?;

        let mut output = ProcedureOutput::default();
        match first {
            Some(Value::Object(map)) => {
                output.first_row = Some(map.into_iter().collect());
            }
            Some(scalar) => {
                output.return_value = Some(scalar);
            }
            None => {}
        }
        Ok(output)
    }
}

/// Document and grid storage. `commit_copy` runs in one transaction and
/// serializes concurrent commits into the same target document through an
/// advisory transaction lock keyed by the document id.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_shared_pool(pool: &DatabasePool) -> Self {
        Self::new(pool.inner().clone())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load_submission(
        &self,
        submission_id: i64,
    ) -> Result<Option<SubmissionSnapshot>, StoreError> {
        let header = sqlx::query("SELECT id, document_id FROM form_submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(header) = header else {
            return Ok(None);
        };
        let document_id: i64 = header.try_get("document_id")?;

        let field_rows = sqlx::query(
            r#"
            SELECT field_code, value, calculated
            FROM submission_field_values
            WHERE submission_id = $1
            ORDER BY field_code
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;
        let field_values = field_rows
            .into_iter()
            .map(|row| {
                Ok(FieldValue {
                    field_code: row.try_get("field_code")?,
                    value: row.try_get("value")?,
                    calculated: row.try_get("calculated")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let grid_rows = sqlx::query(
            r#"
            SELECT grid_code, row_index, cells
            FROM submission_grid_rows
            WHERE submission_id = $1
            ORDER BY grid_code, row_index
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;
        let mut grids: Vec<GridData> = Vec::new();
        for row in grid_rows {
            let grid_code: String = row.try_get("grid_code")?;
            let cells: Value = row.try_get("cells")?;
            let cells = match cells {
                Value::Object(map) => map.into_iter().collect(),
                _ => BTreeMap::new(),
            };
            match grids.last_mut() {
                Some(grid) if grid.grid_code == grid_code => grid.rows.push(GridRow { cells }),
                _ => grids.push(GridData {
                    grid_code,
                    rows: vec![GridRow { cells }],
                }),
            }
        }

        let metadata_rows =
            sqlx::query("SELECT name, value FROM document_metadata WHERE document_id = $1")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        let mut metadata = BTreeMap::new();
        for row in metadata_rows {
            metadata.insert(row.try_get::<String, _>("name")?, row.try_get::<Value, _>("value")?);
        }

        let attachment_rows = sqlx::query(
            "SELECT id, field_code, file_name FROM document_attachments WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        let attachments = attachment_rows
            .into_iter()
            .map(|row| {
                Ok(AttachmentRef {
                    id: row.try_get("id")?,
                    field_code: row.try_get("field_code")?,
                    file_name: row.try_get("file_name")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(SubmissionSnapshot {
            submission_id,
            document_id,
            field_values,
            grids,
            metadata,
            attachments,
        }))
    }

    async fn document_field_values(
        &self,
        document_id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>, StoreError> {
        let exists = sqlx::query("SELECT id FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT field_code, value FROM document_field_values WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        let mut values = BTreeMap::new();
        for row in rows {
            values.insert(
                row.try_get::<String, _>("field_code")?,
                row.try_get::<Value, _>("value")?,
            );
        }
        Ok(Some(values))
    }

    async fn commit_copy(&self, plan: &CopyPlan) -> Result<CopyCommit, StoreError> {
        let mut tx = self.pool.begin().await?;

        let document_id = match &plan.target {
            CopyTarget::Existing { document_id } => {
                lock_document(&mut tx, *document_id).await?;
                let row = sqlx::query("SELECT id FROM documents WHERE id = $1 FOR UPDATE")
                    .bind(*document_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                if row.is_none() {
                    return Err(StoreError::DocumentNotFound(*document_id));
                }
                *document_id
            }
            CopyTarget::CreateNew {
                document_type_id,
                form_id,
                initial_status,
            } => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO documents (document_type_id, form_id, status, created_at)
                    VALUES ($1, $2, $3, now())
                    RETURNING id
                    "#,
                )
                .bind(document_type_id)
                .bind(form_id)
                .bind(initial_status)
                .fetch_one(&mut *tx)
                .await?;
                let id: i64 = row.try_get("id")?;
                sqlx::query(
                    "UPDATE documents SET document_number = 'DOC-' || lpad(id::text, 6, '0') WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                lock_document(&mut tx, id).await?;
                id
            }
        };

        for (field_code, value) in &plan.field_writes {
            sqlx::query(
                r#"
                INSERT INTO document_field_values (document_id, field_code, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (document_id, field_code) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(document_id)
            .bind(field_code)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        for write in &plan.grid_writes {
            let offset: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(MAX(row_index) + 1, 0)
                FROM document_grid_rows
                WHERE document_id = $1 AND grid_code = $2
                "#,
            )
            .bind(document_id)
            .bind(&write.grid_code)
            .fetch_one(&mut *tx)
            .await?;

            for (index, row) in write.rows.iter().enumerate() {
                let cells = Value::Object(row.cells.clone().into_iter().collect());
                sqlx::query(
                    r#"
                    INSERT INTO document_grid_rows (document_id, grid_code, row_index, cells)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(document_id)
                .bind(&write.grid_code)
                .bind(offset + index as i64)
                .bind(cells)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (name, value) in &plan.metadata_writes {
            sqlx::query(
                r#"
                INSERT INTO document_metadata (document_id, name, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (document_id, name) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(document_id)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        for attachment in &plan.attachments {
            sqlx::query(
                r#"
                INSERT INTO document_attachments (document_id, field_code, file_name, source_attachment_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(document_id)
            .bind(&attachment.field_code)
            .bind(&attachment.file_name)
            .bind(attachment.id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(source_document_id) = plan.link_source_document_id {
            sqlx::query("UPDATE documents SET parent_document_id = $2 WHERE id = $1")
                .bind(document_id)
                .bind(source_document_id)
                .execute(&mut *tx)
                .await?;
        }

        let document_number: String =
            sqlx::query_scalar("SELECT COALESCE(document_number, '') FROM documents WHERE id = $1")
                .bind(document_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(CopyCommit {
            document_id,
            document_number,
        })
    }
}

/// Serializes concurrent copies into the same target for the duration of
/// the transaction.
async fn lock_document(tx: &mut Transaction<'_, Postgres>, document_id: i64) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
