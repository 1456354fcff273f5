//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (pool sizes, timeouts > 0)
//! - Resolve encoding names against the supported codec set
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::codec::Codec;
use crate::config::schema::TransportConfig;

/// A single semantic violation in a config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    ZeroPoolSize,
    MinExceedsMax { min: usize, max: usize },
    ZeroTimeout(&'static str),
    UnknownEncoding { field: &'static str, name: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::ZeroPoolSize => write!(f, "pool.max_size must be at least 1"),
            ValidationError::MinExceedsMax { min, max } => {
                write!(f, "pool.min_size {min} exceeds pool.max_size {max}")
            }
            ValidationError::ZeroTimeout(which) => {
                write!(f, "timeouts.{which} must be greater than zero")
            }
            ValidationError::UnknownEncoding { field, name } => {
                write!(f, "encodings.{field} contains unknown coding '{name}'")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a config, collecting every violation.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.pool.max_size == 0 {
        errors.push(ValidationError::ZeroPoolSize);
    }
    if config.pool.min_size > config.pool.max_size {
        errors.push(ValidationError::MinExceedsMax {
            min: config.pool.min_size,
            max: config.pool.max_size,
        });
    }

    for (value, which) in [
        (config.timeouts.request_ms, "request_ms"),
        (config.timeouts.stream_idle_ms, "stream_idle_ms"),
        (config.timeouts.shutdown_ms, "shutdown_ms"),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(which));
        }
    }

    for (names, field) in [
        (&config.encodings.response, "response"),
        (&config.encodings.request, "request"),
    ] {
        for name in names {
            if Codec::from_name(name).is_none() {
                errors.push(ValidationError::UnknownEncoding {
                    field,
                    name: name.clone(),
                });
            }
        }
    }
    if let Some(name) = &config.encodings.request_content_encoding {
        if Codec::from_name(name).is_none() {
            errors.push(ValidationError::UnknownEncoding {
                field: "request_content_encoding",
                name: name.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
