//! clammit: an intercepting proxy that virus-scans uploads.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                       CLAMMIT                         │
//!                        │                                                       │
//!   Client Request       │  ┌─────────┐   ┌──────────┐   ┌───────────┐           │
//!   ─────────────────────┼─▶│   net   │──▶│   http   │──▶│  forward  │           │
//!                        │  │listener │   │  server  │   │ (capture) │           │
//!                        │  └─────────┘   └────┬─────┘   └─────┬─────┘           │
//!                        │                     │               │                 │
//!                        │               ┌─────▼─────┐   ┌─────▼─────┐   ┌──────┐│
//!                        │               │ lifecycle │   │ intercept │──▶│scan- ││──▶ clamd
//!                        │               │ shutdown  │   │  (scan)   │   │ ner  ││
//!                        │               └───────────┘   └─────┬─────┘   └──────┘│
//!                        │                                     │ pass            │
//!   Client Response      │                               ┌─────▼─────┐           │
//!   ◀────────────────────┼───────────────────────────────│  forward  │◀──────────┼──── Backend
//!                        │                               │ (replay)  │           │
//!                        │                               └───────────┘           │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use clap::Parser;

use clammit::config::{self, ClammitConfig};
use clammit::forward::{BackendTarget, Forwarder};
use clammit::http::ClammitServer;
use clammit::intercept::ScanInterceptor;
use clammit::lifecycle::{self, ShutdownCoordinator, DEFAULT_DRAIN_LOG_INTERVAL};
use clammit::net::{parse_listen_address, BoundListener};
use clammit::observability::{self, MetricsReporter};
use clammit::scanner::{ClamdClient, ScanEngine};

#[derive(Parser)]
#[command(name = "clammit")]
#[command(about = "HTTP proxy that scans uploaded files with clamd", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if config.application.num_threads > 0 {
        runtime.worker_threads(config.application.num_threads);
    }
    runtime.enable_all().build()?.block_on(run(config))
}

async fn run(config: ClammitConfig) -> Result<(), Box<dyn std::error::Error>> {
    let app = &config.application;

    let log_file = non_empty(&app.log_file).map(PathBuf::from);
    observability::logging::init_logging(log_file.as_deref(), app.debug)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "clammit starting");

    if config.metrics.enabled {
        observability::metrics::init_metrics(config.metrics.address.parse()?)?;
    }

    let scan_timeout = (app.scan_timeout_secs > 0).then(|| Duration::from_secs(app.scan_timeout_secs));
    let engine: Arc<dyn ScanEngine> = Arc::new(ClamdClient::new(&app.clamd_url)?.with_timeout(scan_timeout));

    let max_file_size = config::parse_byte_size(&app.max_file_size)?;
    let interceptor = ScanInterceptor::new(engine.clone())
        .with_virus_status(StatusCode::from_u16(app.virus_status_code)?)
        .with_max_file_size(max_file_size)
        .with_reporter(Arc::new(MetricsReporter));

    let backend = non_empty(&app.application_url)
        .map(BackendTarget::from_url)
        .transpose()?;
    let forwarder = Forwarder::new(Arc::new(interceptor))
        .with_backend(backend)
        .with_memory_threshold(app.content_memory_threshold)
        .with_scratch_root(non_empty(&app.scratch_dir).map(PathBuf::from));

    tracing::info!(
        listen = %app.listen,
        clamd_url = %app.clamd_url,
        application_url = %app.application_url,
        virus_status_code = app.virus_status_code,
        content_memory_threshold = app.content_memory_threshold,
        max_file_size = ?max_file_size,
        "Configuration loaded"
    );

    let shutdown = ShutdownCoordinator::spawn(DEFAULT_DRAIN_LOG_INTERVAL);
    lifecycle::signals::install(shutdown.clone())?;

    let address = parse_listen_address(&app.listen)?;
    let perms = config::parse_socket_perms(&app.unix_socket_perms)?;
    let listener = BoundListener::bind(&address, perms).await?;

    let server = ClammitServer::new(Arc::new(forwarder), engine, shutdown);
    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}
