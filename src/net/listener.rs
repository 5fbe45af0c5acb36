//! Listener address parsing and binding.
//!
//! # Responsibilities
//! - Parse `tcp:`, `tcp4:`, `tcp6:`, `unix:` and bare listen addresses
//! - Bind TCP listeners or Unix sockets (with permissions applied)
//! - Record the caller address for each accepted connection

use std::fs::Permissions;
use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use tokio::net::{TcpListener, UnixListener};

use crate::intercept::SYNTHETIC_CALLER;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// The listen address could not be understood.
    Address(String),
    /// Failed to bind to address.
    Bind { address: String, source: std::io::Error },
    /// Failed to prepare or chmod a Unix socket file.
    Socket { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Address(reason) => write!(f, "Invalid listen address: {}", reason),
            ListenerError::Bind { address, source } => write!(f, "Failed to bind {}: {}", address, source),
            ListenerError::Socket { path, source } => {
                write!(f, "Failed to prepare socket {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Address(_) => None,
            ListenerError::Bind { source, .. } | ListenerError::Socket { source, .. } => Some(source),
        }
    }
}

/// Where the proxy listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// `host:port` handed to the TCP resolver.
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Tcp(address) => write!(f, "tcp:{}", address),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Parse a configured listen address.
///
/// `tcp:port`, `:port` and `port` listen on every IPv4 interface,
/// `tcp6:port` on every IPv6 interface. Unknown prefixes are taken as a
/// TCP `host:port`.
pub fn parse_listen_address(raw: &str) -> Result<ListenAddress, ListenerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ListenerError::Address("no listen address specified".into()));
    }

    if let Some(path) = raw.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(ListenerError::Address("unix socket path is empty".into()));
        }
        return Ok(ListenAddress::Unix(PathBuf::from(path)));
    }

    if let Some(rest) = raw.strip_prefix("tcp6:") {
        let rest = rest.strip_prefix(':').filter(|p| is_port(p)).unwrap_or(rest);
        let address = if is_port(rest) { format!("[::]:{}", rest) } else { rest.to_string() };
        return Ok(ListenAddress::Tcp(address));
    }

    let rest = raw
        .strip_prefix("tcp4:")
        .or_else(|| raw.strip_prefix("tcp:"))
        .unwrap_or(raw);
    let port = rest.strip_prefix(':').unwrap_or(rest);
    if is_port(port) {
        return Ok(ListenAddress::Tcp(format!("0.0.0.0:{}", port)));
    }
    Ok(ListenAddress::Tcp(rest.to_string()))
}

fn is_port(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// A bound listening socket.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl BoundListener {
    /// Bind `address`. Unix sockets get `socket_perms` as their file mode.
    pub async fn bind(address: &ListenAddress, socket_perms: u32) -> Result<Self, ListenerError> {
        match address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|source| {
                    ListenerError::Bind {
                        address: addr.clone(),
                        source,
                    }
                })?;
                let local = listener.local_addr().ok();
                tracing::info!(address = ?local, "Listening on TCP");
                Ok(BoundListener::Tcp(listener))
            }
            ListenAddress::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
                    address: path.display().to_string(),
                    source,
                })?;
                std::fs::set_permissions(path, Permissions::from_mode(socket_perms)).map_err(|source| {
                    ListenerError::Socket {
                        path: path.clone(),
                        source,
                    }
                })?;
                tracing::info!(path = %path.display(), perms = format_args!("{:o}", socket_perms), "Listening on unix socket");
                Ok(BoundListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix { .. } => None,
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), ListenerError> {
    let socket_error = |source| ListenerError::Socket {
        path: path.to_path_buf(),
        source,
    };
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(socket_error)
        }
        Ok(_) => Err(socket_error(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(socket_error(e)),
    }
}

/// Caller address recorded per connection: `ip:port` for TCP, `@` for Unix sockets.
#[derive(Debug, Clone)]
pub struct PeerAddr(pub String);

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        PeerAddr(stream.remote_addr().to_string())
    }
}

impl Connected<IncomingStream<'_, UnixListener>> for PeerAddr {
    fn connect_info(_stream: IncomingStream<'_, UnixListener>) -> Self {
        PeerAddr(SYNTHETIC_CALLER.to_string())
    }
}
