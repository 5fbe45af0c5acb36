//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/Unix connection
//!     → server.rs (Axum setup, request ID, trace span)
//!     → track_activity (ShutdownCoordinator registration, 503 when draining)
//!     → /clammit, /clammit/scan → diagnostics.rs
//!     → anything else → Forwarder
//!     → Send to client
//! ```

pub mod diagnostics;
pub mod server;

pub use diagnostics::ServerInfo;
pub use server::{AppState, ClammitServer};
