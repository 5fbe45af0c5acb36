//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configured listen address
//!     → listener.rs (parse scheme: tcp / tcp4 / tcp6 / unix / host:port)
//!     → BoundListener (TcpListener or UnixListener)
//!     → Hand off to HTTP layer (PeerAddr records the caller)
//! ```
//!
//! # Design Decisions
//! - Unix socket files are chmod'ed after bind and removed after serving
//! - Unix callers have no address; they are recorded as "@"

pub mod listener;

pub use listener::{parse_listen_address, BoundListener, ListenAddress, ListenerError, PeerAddr};
