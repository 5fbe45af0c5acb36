//! Content scanning subsystem.
//!
//! # Data Flow
//! ```text
//! ByteSource (whole body or one multipart part)
//!     → ScanEngine::scan_stream
//!     → clamd.rs (zINSTREAM, length-prefixed chunks, zero terminator)
//!     → one reply line, remainder drained
//!     → ScanOutcome { Clean | Infected | EngineError }
//! ```
//!
//! # Design Decisions
//! - The engine sits behind a trait so tests and other engines can stand in
//! - One connection per call; dropping the scan future closes it
//! - Engine internals are logged, never shown to HTTP callers

pub mod clamd;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use clamd::{ClamdClient, EngineAddress};

/// A stream of bytes submitted to the engine.
pub type ByteSource<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Verdict category of a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Clean,
    Infected,
    EngineError,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStatus::Clean => write!(f, "CLEAN"),
            ScanStatus::Infected => write!(f, "FOUND"),
            ScanStatus::EngineError => write!(f, "ERROR"),
        }
    }
}

/// Result of scanning one unit.
///
/// `description` carries the engine message; for infections it is the
/// reported signature name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub description: String,
}

impl ScanOutcome {
    pub fn clean(description: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::Clean,
            description: description.into(),
        }
    }

    pub fn infected(signature: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::Infected,
            description: signature.into(),
        }
    }

    pub fn engine_error(description: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::EngineError,
            description: description.into(),
        }
    }

    pub fn is_infected(&self) -> bool {
        self.status == ScanStatus::Infected
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status: {}; Virus: {}", self.status, self.is_infected())?;
        if self.is_infected() {
            write!(f, "; Description: {}", self.description)?;
        }
        Ok(())
    }
}

/// Errors raised while talking to a scan engine.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The engine address could not be understood.
    #[error("invalid scan engine address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Connecting, writing or reading failed, or the engine timed out.
    #[error("scan engine at {address} unavailable: {source}")]
    EngineUnavailable {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The engine answered with something that does not fit the protocol.
    #[error("scan engine protocol error: {0}")]
    EngineProtocolError(String),

    /// The bytes being scanned could not be read.
    #[error("failed to read scan source: {0}")]
    Source(#[source] io::Error),
}

/// Capability set of an external content-scanning engine.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Address the engine is reached at, for diagnostics.
    fn address(&self) -> &str;

    /// Submit the whole of `source` and return the engine's verdict.
    async fn scan_stream(&self, source: ByteSource<'_>) -> Result<ScanOutcome, ScanError>;

    /// Lightweight round trip proving the engine is alive.
    async fn probe_liveness(&self) -> Result<(), ScanError>;

    /// Version string reported by the engine.
    async fn report_version(&self) -> Result<String, ScanError>;
}
