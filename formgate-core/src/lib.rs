//! Core shared types and utilities for the formgate rule engine.
//!
//! This crate carries the infrastructure every formgate service leans on:
//! the canonical error type, environment-driven configuration, the Postgres
//! pool wrapper and tracing bootstrap. Domain logic lives in `formgate-rules`.

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;

pub use config::{load_core_config, CoreConfig, Environment};
pub use db::DatabasePool;
pub use errors::{ConfigError, CoreError, Result};
pub use logging::init_tracing;
