//! Configuration loading.
//!
//! # Responsibilities
//! - Read TOML config from disk
//! - Deserialize into typed structs
//! - Run semantic validation before handing the config out
//!
//! # Design Decisions
//! - Missing file is an error; callers wanting defaults use TransportConfig::default()
//! - Parse and validation failures are reported separately

use std::path::Path;

use crate::config::schema::TransportConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", format_violations(.0))]
    Validation(Vec<ValidationError>),
}

fn format_violations(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Load and validate a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<TransportConfig, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let config: TransportConfig = toml::from_str(&raw)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    tracing::info!(path = %path.as_ref().display(), "loaded transport config");
    Ok(config)
}
