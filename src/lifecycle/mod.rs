//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Request handler
//!     → ShutdownHandle::enter (registered, or rejected with 503)
//!     → ActivityGuard dropped when the response is produced
//!
//! Shutdown (shutdown.rs):
//!     terminate → stop accepting → drain in-flight → closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ShutdownHandle::terminate
//! ```
//!
//! # Design Decisions
//! - One actor owns the flag and the counter; everything else sends messages
//! - The listener closes only after the drain completes

pub mod shutdown;
pub mod signals;

pub use shutdown::{
    ActivityGuard, ShutdownCoordinator, ShutdownHandle, ShutdownSnapshot, DEFAULT_DRAIN_LOG_INTERVAL,
};
