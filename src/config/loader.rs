//! Configuration loading from disk and the environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::schema::ClammitConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load configuration: defaults, then the TOML file (if any), then
/// `CLAMMIT_*` environment variables, then validation.
pub fn load_config(path: Option<&Path>) -> Result<ClammitConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => ClammitConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<ClammitConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Overlay environment values onto `config`.
///
/// `lookup` returns the value of a variable. Values that do not parse
/// (numbers, booleans) are ignored and the previous setting kept.
pub fn apply_env_overrides(config: &mut ClammitConfig, lookup: impl Fn(&str) -> Option<String>) {
    let app = &mut config.application;
    override_string(&lookup, "CLAMMIT_LISTEN", &mut app.listen);
    override_string(&lookup, "CLAMMIT_SOCKET_PERMS", &mut app.unix_socket_perms);
    override_string(&lookup, "CLAMMIT_APPLICATION_URL", &mut app.application_url);
    override_string(&lookup, "CLAMMIT_CLAMD_URL", &mut app.clamd_url);
    override_parsed(&lookup, "CLAMMIT_VIRUS_STATUS_CODE", &mut app.virus_status_code);
    override_parsed(&lookup, "CLAMMIT_CONTENT_MEMORY_THRESHOLD", &mut app.content_memory_threshold);
    override_string(&lookup, "CLAMMIT_MAX_FILE_SIZE", &mut app.max_file_size);
    override_string(&lookup, "CLAMMIT_SCRATCH_DIR", &mut app.scratch_dir);
    override_parsed(&lookup, "CLAMMIT_SCAN_TIMEOUT_SECS", &mut app.scan_timeout_secs);
    override_string(&lookup, "CLAMMIT_LOGFILE", &mut app.log_file);
    override_bool(&lookup, "CLAMMIT_DEBUG", &mut app.debug);
    override_parsed(&lookup, "CLAMMIT_NUM_THREADS", &mut app.num_threads);

    let metrics = &mut config.metrics;
    override_bool(&lookup, "CLAMMIT_METRICS_ENABLED", &mut metrics.enabled);
    override_string(&lookup, "CLAMMIT_METRICS_ADDRESS", &mut metrics.address);
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(value) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *target = value;
    }
}

fn override_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    let parsed = lookup(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    });
    if let Some(value) = parsed {
        *target = value;
    }
}
