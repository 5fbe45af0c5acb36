//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check addresses and URLs use schemes clammit can serve
//! - Validate value ranges (status codes, sizes, file modes)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClammitConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::StatusCode;
use url::Url;

use crate::config::schema::{parse_byte_size, parse_socket_perms, ClammitConfig};

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &ClammitConfig) -> Result<(), Vec<ValidationError>> {
    let app = &config.application;
    let mut errors = Vec::new();

    if app.listen.trim().is_empty() {
        errors.push(ValidationError::new("application.listen", "no listen address specified"));
    }

    if app.clamd_url.trim().is_empty() {
        errors.push(ValidationError::new("application.clamd_url", "no clamd URL specified"));
    } else if let Err(message) = check_url(&app.clamd_url, &["tcp", "unix"]) {
        errors.push(ValidationError::new("application.clamd_url", message));
    }

    if !app.application_url.trim().is_empty() {
        if let Err(message) = check_url(&app.application_url, &["http", "unix"]) {
            errors.push(ValidationError::new("application.application_url", message));
        }
    }

    if StatusCode::from_u16(app.virus_status_code).is_err() {
        errors.push(ValidationError::new(
            "application.virus_status_code",
            format!("{} is not a valid HTTP status", app.virus_status_code),
        ));
    }

    if let Err(message) = parse_socket_perms(&app.unix_socket_perms) {
        errors.push(ValidationError::new("application.unix_socket_perms", message));
    }

    if let Err(message) = parse_byte_size(&app.max_file_size) {
        errors.push(ValidationError::new("application.max_file_size", message));
    }

    if config.metrics.enabled && config.metrics.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "metrics.address",
            format!("'{}' is not a socket address", config.metrics.address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("'{}' is not a URL: {}", raw, e))?;
    if schemes.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(format!(
            "scheme '{}' is not supported (expected one of: {})",
            url.scheme(),
            schemes.join(", ")
        ))
    }
}
