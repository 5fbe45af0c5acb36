//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → forwarder.rs (capture body into a BodyStore)
//!     → Interceptor::handle (cursor #1)
//!     → backend.rs (resolve BackendTarget: static URL or X-Clammit-Backend)
//!     → forwarder.rs (replay cursor #2 over TCP or a Unix socket)
//!     → Backend response relayed verbatim
//!     → BodyStore released
//! ```
//!
//! # Design Decisions
//! - Redirects are never followed; the backend's 3xx goes back to the caller
//! - Failures map to 500/502 with generic bodies; detail goes to the log
//! - Panics while intercepting or forwarding are contained at this boundary

pub mod backend;
pub mod forwarder;

use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::body::CaptureError;

pub use backend::{BackendTarget, BACKEND_HEADER};
pub use forwarder::Forwarder;

/// Errors raised while handling a proxied request.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("unable to reopen captured body: {0}")]
    Cursor(#[source] io::Error),

    #[error("unable to resolve backend: {0}")]
    BackendResolution(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend closed the connection without responding")]
    NoResponse,

    #[error("{0} panicked")]
    Fault(&'static str),

    #[error("unable to build backend request: {0}")]
    Request(#[from] axum::http::Error),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::BackendUnreachable(_) | ForwardError::NoResponse => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let message = match &self {
            ForwardError::Capture(_) | ForwardError::Cursor(_) => "Clammit is unable to save the request",
            ForwardError::BackendResolution(_) => "Clammit is unable to determine the backend",
            ForwardError::BackendUnreachable(_) | ForwardError::NoResponse => "Bad Gateway",
            ForwardError::Fault(_) | ForwardError::Request(_) => "Internal Server Error",
        };
        (self.status(), message).into_response()
    }
}
