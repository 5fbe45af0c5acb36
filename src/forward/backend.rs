//! Backend target resolution.

use std::fmt;
use std::path::PathBuf;

use axum::http::uri::{Authority, PathAndQuery};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use url::Url;

use crate::forward::ForwardError;

/// Per-request backend override, honoured only when no static backend is set.
pub const BACKEND_HEADER: HeaderName = HeaderName::from_static("x-clammit-backend");

/// Host header sent to Unix-socket backends.
const UNIX_HOST: &str = "localhost";

/// Where clean requests are forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// Plain HTTP over TCP.
    Network { authority: Authority },
    /// HTTP/1.1 over a local Unix socket.
    UnixSocket { path: PathBuf },
}

impl BackendTarget {
    /// Parse an `http://host[:port]` or `unix:/path` URL.
    ///
    /// Only the scheme and location are kept; request paths come from the
    /// inbound request.
    pub fn from_url(raw: &str) -> Result<Self, ForwardError> {
        let invalid = |reason: String| ForwardError::BackendResolution(format!("'{raw}': {reason}"));
        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;

        match url.scheme() {
            "http" => {
                let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
                let authority = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                let authority = authority
                    .parse::<Authority>()
                    .map_err(|e| invalid(e.to_string()))?;
                Ok(BackendTarget::Network { authority })
            }
            "unix" => {
                if url.path().is_empty() {
                    return Err(invalid("missing socket path".into()));
                }
                Ok(BackendTarget::UnixSocket {
                    path: PathBuf::from(url.path()),
                })
            }
            other => Err(invalid(format!("unsupported scheme '{other}'"))),
        }
    }

    /// Use `configured` if present, otherwise the request's override header.
    pub fn resolve(configured: Option<&BackendTarget>, headers: &HeaderMap) -> Result<Self, ForwardError> {
        if let Some(target) = configured {
            return Ok(target.clone());
        }

        let value = headers.get(BACKEND_HEADER).ok_or_else(|| {
            ForwardError::BackendResolution(format!(
                "no application URL configured and no {BACKEND_HEADER} header"
            ))
        })?;
        let raw = value.to_str().map_err(|_| {
            ForwardError::BackendResolution(format!("{BACKEND_HEADER} header is not valid text"))
        })?;
        Self::from_url(raw)
    }

    /// URI for the outbound request: the inbound path and query on this target.
    pub fn request_uri(&self, inbound: &Uri) -> Result<Uri, axum::http::Error> {
        let path_and_query = inbound
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        match self {
            BackendTarget::Network { authority } => Uri::builder()
                .scheme("http")
                .authority(authority.clone())
                .path_and_query(path_and_query)
                .build(),
            BackendTarget::UnixSocket { .. } => Uri::builder().path_and_query(path_and_query).build(),
        }
    }

    pub fn host_header(&self) -> Result<HeaderValue, axum::http::Error> {
        let host = match self {
            BackendTarget::Network { authority } => authority.as_str(),
            BackendTarget::UnixSocket { .. } => UNIX_HOST,
        };
        Ok(HeaderValue::from_str(host)?)
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTarget::Network { authority } => write!(f, "http://{authority}"),
            BackendTarget::UnixSocket { path } => write!(f, "unix:{}", path.display()),
        }
    }
}
