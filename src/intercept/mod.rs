//! Request interception subsystem.
//!
//! # Data Flow
//! ```text
//! RequestMeta + body cursor
//!     → Interceptor::handle
//!     → scan.rs (method/size/empty gates, multipart parsing, per-unit scan)
//!     → Decision::Pass            (forwarder continues)
//!     → Decision::Block(response) (forwarder returns the response as is)
//! ```
//!
//! # Design Decisions
//! - The interceptor is a trait object so policies can be swapped
//! - A blocking decision carries the complete response it wants sent

pub mod scan;

use async_trait::async_trait;
use axum::http::{header, request::Parts, HeaderMap, HeaderName, Method, Uri};
use axum::response::Response;

use crate::body::BodyStream;

pub use scan::{ScanInterceptor, DEFAULT_VIRUS_STATUS, PLACEHOLDER_NAME};

/// Caller address used by internal and Unix-socket callers.
pub const SYNTHETIC_CALLER: &str = "@";

/// Chain-tracking header appended to on every hop.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// What an interceptor sees of a request besides its body.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: String,
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
}

impl RequestMeta {
    pub fn from_parts(parts: &Parts, remote_addr: impl Into<String>) -> Self {
        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            remote_addr: remote_addr.into(),
            content_length,
        }
    }

    /// Incoming forwarded-for chain, joined as one string.
    pub fn forwarded_for(&self) -> String {
        self.headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of interception.
pub enum Decision {
    /// Forward the request.
    Pass,
    /// Do not forward; send this response instead.
    Block(Response),
}

impl Decision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Decision::Pass)
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Pass => write!(f, "Pass"),
            Decision::Block(response) => write!(f, "Block({})", response.status()),
        }
    }
}

/// Policy consulted before a request is forwarded.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Inspect a request. `body` reads the captured body from the start.
    async fn handle(&self, request: &RequestMeta, body: BodyStream) -> Decision;
}
