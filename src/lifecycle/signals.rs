//! OS signal handling.
//!
//! # Responsibilities
//! - Listen for SIGTERM and SIGINT
//! - Hand the first one to the shutdown coordinator
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Repeated signals are logged; draining is never cut short

use std::io;

use tokio::signal::unix::{signal, SignalKind};

use crate::lifecycle::ShutdownHandle;

/// Spawn a task that terminates `shutdown` on SIGINT/SIGTERM.
pub fn install(shutdown: ShutdownHandle) -> io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            tracing::info!(signal = name, "Received signal, shutting down");
            shutdown.terminate();
        }
    });
    Ok(())
}
