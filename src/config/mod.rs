//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize over defaults)
//!     → loader.rs (CLAMMIT_* environment overrides)
//!     → validation.rs (semantic checks)
//!     → ClammitConfig (validated, immutable)
//!     → converted to plain values and injected into each component
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; there is no reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{apply_env_overrides, load_config, ConfigError};
pub use schema::{parse_byte_size, parse_socket_perms, ApplicationConfig, ClammitConfig, MetricsConfig};
pub use validation::{validate_config, ValidationError};
