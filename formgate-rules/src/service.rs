use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::info;

use crate::engine::{BlockingRuleEvaluator, EvaluationRequest};
use crate::error::EngineError;
use crate::outcome::{BlockingRuleResult, FormValidationResult};
use crate::rule::EvaluationPhase;

/// Payload of `POST /forms/:form_id/rules/evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRulesRequest {
    pub evaluation_phase: String,
    #[serde(default)]
    pub submission_id: Option<i64>,
    #[serde(default)]
    pub field_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub include_debug_info: bool,
}

/// Payload of `POST /forms/:form_id/rules/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRulesRequest {
    pub field_values: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

#[derive(Clone)]
struct EngineServiceState {
    evaluator: Arc<BlockingRuleEvaluator>,
}

/// Configuration for the engine API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8085".to_string()
}

impl Default for EngineServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Helper used by services to compose the REST API router.
#[derive(Clone)]
pub struct EngineApiBuilder {
    state: EngineServiceState,
}

impl EngineApiBuilder {
    pub fn new(evaluator: Arc<BlockingRuleEvaluator>) -> Self {
        Self {
            state: EngineServiceState { evaluator },
        }
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/forms/:form_id/rules/evaluate", post(evaluate_rules))
            .route("/forms/:form_id/rules/validate", post(validate_rules))
            .with_state(self.state)
    }

    /// Spawns an HTTP server binding to the configured address.
    pub async fn serve(self, config: EngineServiceConfig) -> anyhow::Result<oneshot::Sender<()>> {
        let (tx, rx) = oneshot::channel();
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        let state = self.state.clone();

        tokio::spawn(async move {
            info!(address = %config.bind_address, "starting rule engine service");
            let app = EngineApiBuilder { state }.into_router();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
                .ok();
        });

        Ok(tx)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn evaluate_rules(
    State(state): State<EngineServiceState>,
    Path(form_id): Path<i64>,
    Json(payload): Json<EvaluateRulesRequest>,
) -> Result<Json<BlockingRuleResult>, (StatusCode, Json<ErrorResponse>)> {
    // Phase validation happens before any rule is loaded.
    let phase = EvaluationPhase::parse(&payload.evaluation_phase).map_err(error_response)?;

    let request = EvaluationRequest {
        form_id,
        phase,
        submission_id: payload.submission_id,
        field_values: payload.field_values,
        include_debug_info: payload.include_debug_info,
    };
    let result = state
        .evaluator
        .evaluate(&request)
        .await
        .map_err(error_response)?;
    Ok(Json(result))
}

async fn validate_rules(
    State(state): State<EngineServiceState>,
    Path(form_id): Path<i64>,
    Json(payload): Json<ValidateRulesRequest>,
) -> Result<Json<FormValidationResult>, (StatusCode, Json<ErrorResponse>)> {
    let result = state
        .evaluator
        .validate_form(form_id, payload.field_values)
        .await
        .map_err(error_response)?;
    Ok(Json(result))
}

fn error_response(error: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &error {
        EngineError::InvalidPhase(_) => (StatusCode::BAD_REQUEST, "invalid_phase"),
        EngineError::Configuration { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error"),
        EngineError::FieldCircularReference { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "field_circular_reference")
        }
        EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    };
    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }),
    )
}
