//! Request body capture subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound body stream
//!     → store.rs (capture: memory buffer or scratch file)
//!     → BodyStore (immutable, re-readable)
//!     → open_cursor() #1 → interceptor (scan)
//!     → open_cursor() #2 → forwarder (replay to backend)
//!     → release() (scratch area removed)
//! ```
//!
//! # Design Decisions
//! - Small bodies with a known length stay in memory
//! - Unknown, zero or large declared lengths spill to disk
//! - Each disk capture owns a private scratch directory (scratch.rs)

pub mod scratch;
pub mod store;

pub use scratch::ScratchArea;
pub use store::{BodyStore, BodyStream, CaptureError, DEFAULT_MEMORY_THRESHOLD};
