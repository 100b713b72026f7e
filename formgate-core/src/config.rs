use std::env;

use crate::errors::{ConfigError, CoreError};

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Global configuration shared across the formgate services.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub environment: Environment,
    pub http_bind: Option<String>,
    /// Upper bound applied to every stored-procedure invocation, in seconds.
    pub procedure_timeout_secs: u64,
}

impl CoreConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".into()))?;

        let environment = env::var("FORMGATE_ENV")
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let http_bind = env::var("FORMGATE_HTTP_BIND").ok();
        let procedure_timeout_secs = env::var("FORMGATE_PROCEDURE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Self::DEFAULT_PROCEDURE_TIMEOUT_SECS);

        Ok(Self {
            database_url,
            environment,
            http_bind,
            procedure_timeout_secs,
        })
    }

    /// Loads configuration from env vars prefixed with the provided value (e.g. `RULES_`).
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let db_key = key("DATABASE_URL");
        let database_url =
            env::var(&db_key).map_err(|_| ConfigError::MissingEnvVar(db_key.clone()))?;

        let env_key = key("ENV");
        let environment = env::var(&env_key)
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let http_bind = env::var(key("HTTP_BIND")).ok();
        let procedure_timeout_secs = env::var(key("PROCEDURE_TIMEOUT_SECS"))
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Self::DEFAULT_PROCEDURE_TIMEOUT_SECS);

        Ok(Self {
            database_url,
            environment,
            http_bind,
            procedure_timeout_secs,
        })
    }

    pub const DEFAULT_PROCEDURE_TIMEOUT_SECS: u64 = 30;

    /// Returns the base Postgres URL.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

/// Helper that loads config and converts to the canonical formgate error type.
pub fn load_core_config() -> Result<CoreConfig, CoreError> {
    CoreConfig::from_env().map_err(CoreError::from)
}
