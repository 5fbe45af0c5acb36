//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for clammit.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClammitConfig {
    /// Proxy, scanner and logging settings.
    pub application: ApplicationConfig,

    /// Prometheus exporter settings.
    pub metrics: MetricsConfig,
}

/// Application settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Listen address: `tcp:host:port`, `tcp6:port`, `unix:/path`, `:port`, ...
    pub listen: String,

    /// Octal file mode applied to a Unix listen socket.
    pub unix_socket_perms: String,

    /// Backend base URL. Empty means each request names its backend in
    /// the `X-Clammit-Backend` header.
    pub application_url: String,

    /// clamd address: `tcp://host:port` or `unix:/path/to/clamd.sock`.
    pub clamd_url: String,

    /// Status returned when a virus is found.
    pub virus_status_code: u16,

    /// Bodies with a declared length up to this size are held in memory.
    pub content_memory_threshold: u64,

    /// Bodies larger than this are forwarded unscanned. Empty means no limit.
    pub max_file_size: String,

    /// Base directory for scratch areas. Empty means the OS temp dir.
    pub scratch_dir: String,

    /// Timeout for a single engine call in seconds; 0 disables it.
    pub scan_timeout_secs: u64,

    /// Log file; empty logs to stdout.
    pub log_file: String,

    pub debug: bool,

    /// Runtime worker threads; 0 uses the number of CPUs.
    pub num_threads: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            listen: ":8438".to_string(),
            unix_socket_perms: "0777".to_string(),
            application_url: String::new(),
            clamd_url: String::new(),
            virus_status_code: 418,
            content_memory_threshold: 1024 * 1024,
            max_file_size: String::new(),
            scratch_dir: String::new(),
            scan_timeout_secs: 0,
            log_file: String::new(),
            debug: false,
            num_threads: 0,
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Address of the Prometheus scrape endpoint.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9102".to_string(),
        }
    }
}

/// Parse a size such as `512`, `100KB`, `10 MB` or `2g` into bytes.
///
/// Units are binary (1KB = 1024 bytes). An empty string means "no limit".
pub fn parse_byte_size(raw: &str) -> Result<Option<u64>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{}' does not start with a number", raw))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    value
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| format!("'{}' is too large", raw))
}

/// Parse an octal file mode such as `0777` or `660`.
pub fn parse_socket_perms(raw: &str) -> Result<u32, String> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("'{}' is not an octal file mode", raw)),
    }
}
