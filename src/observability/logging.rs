//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once at startup
//! - Route output to stdout or an append-only log file
//! - Pick the default level from the debug flag
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the computed default filter
//! - Log files are opened with mode 0660 and no ANSI colouring

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directives for the given debug setting.
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "clammit=debug,tower_http=debug"
    } else {
        "clammit=info,tower_http=info"
    }
}

/// Install the global subscriber.
pub fn init_logging(log_file: Option<&Path>, debug: bool) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(debug).into());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o660)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            tracing::info!("No log file configured - using stdout");
        }
    }
    Ok(())
}
