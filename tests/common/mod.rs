//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use clammit::forward::{BackendTarget, Forwarder};
use clammit::http::ClammitServer;
use clammit::intercept::ScanInterceptor;
use clammit::lifecycle::{ShutdownCoordinator, ShutdownHandle};
use clammit::net::{BoundListener, ListenAddress};
use clammit::scanner::{ClamdClient, ScanEngine};

pub const VIRUS_MARKER: &[u8] = b"<virus/>";

/// A scripted clamd speaking the INSTREAM, PING and VERSION commands.
///
/// Any payload containing [`VIRUS_MARKER`] or the EICAR string is infected.
pub struct MockClamd {
    pub url: String,
    scans: Arc<AtomicUsize>,
}

impl MockClamd {
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

pub async fn start_clamd() -> MockClamd {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scans = Arc::new(AtomicUsize::new(0));

    let counter = scans.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = serve_clamd(socket, counter).await;
            });
        }
    });

    MockClamd {
        url: format!("tcp://{addr}"),
        scans,
    }
}

async fn serve_clamd(socket: TcpStream, scans: Arc<AtomicUsize>) -> io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut command = Vec::new();
    reader.read_until(0, &mut command).await?;

    let reply: &[u8] = match command.as_slice() {
        b"zPING\0" => b"PONG\0",
        b"zVERSION\0" => b"ClamAV 1.0.0/27000/Mon Jan 1 00:00:00 2024\0",
        b"zINSTREAM\0" => {
            let mut payload = Vec::new();
            loop {
                let len = reader.read_u32().await?;
                if len == 0 {
                    break;
                }
                let mut segment = vec![0; len as usize];
                reader.read_exact(&mut segment).await?;
                payload.extend_from_slice(&segment);
            }
            scans.fetch_add(1, Ordering::SeqCst);
            if contains(&payload, VIRUS_MARKER) || contains(&payload, b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE") {
                b"stream: Eicar-Test-Signature FOUND\0"
            } else {
                b"stream: OK\0"
            }
        }
        _ => b"UNKNOWN COMMAND\0",
    };

    let socket = reader.get_mut();
    socket.write_all(reply).await?;
    socket.shutdown().await
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// A request as seen by the mock backend.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct BackendState {
    log: Arc<Mutex<Vec<Recorded>>>,
    gate: watch::Receiver<bool>,
}

/// An axum backend that records every request.
///
/// - `/redirect` answers 302 with `Location: /elsewhere`
/// - `/slow` waits until [`MockBackend::release`] is called
/// - anything else answers 200 `backend ok`
pub struct MockBackend {
    pub url: String,
    log: Arc<Mutex<Vec<Recorded>>>,
    gate: watch::Sender<bool>,
}

impl MockBackend {
    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Let every waiting and future `/slow` request complete.
    pub fn release(&self) {
        let _ = self.gate.send(true);
    }
}

fn backend_router() -> (Router, Arc<Mutex<Vec<Recorded>>>, watch::Sender<bool>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (gate_tx, gate_rx) = watch::channel(false);
    let state = BackendState {
        log: log.clone(),
        gate: gate_rx,
    };
    let router = Router::new()
        .route("/redirect", any(redirect))
        .route("/slow", any(slow))
        .fallback(ok)
        .with_state(state);
    (router, log, gate_tx)
}

pub async fn start_backend() -> MockBackend {
    let (router, log, gate) = backend_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    MockBackend {
        url: format!("http://{addr}"),
        log,
        gate,
    }
}

pub async fn start_unix_backend(path: &Path) -> MockBackend {
    let (router, log, gate) = backend_router();
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });
    MockBackend {
        url: format!("unix:{}", path.display()),
        log,
        gate,
    }
}

fn record(state: &BackendState, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) {
    state.log.lock().unwrap().push(Recorded {
        method,
        uri: uri.to_string(),
        headers,
        body,
    });
}

async fn ok(State(state): State<BackendState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    record(&state, method, uri, headers, body);
    ([("x-backend", "mock")], "backend ok").into_response()
}

async fn redirect(State(state): State<BackendState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    record(&state, method, uri, headers, body);
    (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")], "").into_response()
}

async fn slow(State(state): State<BackendState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    record(&state, method, uri, headers, body);
    let mut gate = state.gate.clone();
    let _ = gate.wait_for(|open| *open).await;
    "slow done".into_response()
}

/// How a test proxy is wired.
pub struct ProxyOptions {
    pub backend: Option<String>,
    pub memory_threshold: u64,
    pub scratch_root: Option<PathBuf>,
    pub max_file_size: Option<u64>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            backend: None,
            memory_threshold: 1024 * 1024,
            scratch_root: None,
            max_file_size: None,
        }
    }
}

impl ProxyOptions {
    pub fn backend(url: &str) -> Self {
        Self {
            backend: Some(url.to_string()),
            ..Self::default()
        }
    }
}

pub struct RunningProxy {
    pub url: String,
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
    pub task: JoinHandle<io::Result<()>>,
}

/// Start a clammit server on an ephemeral port.
pub async fn start_proxy(clamd_url: &str, options: ProxyOptions) -> RunningProxy {
    let engine: Arc<dyn ScanEngine> =
        Arc::new(ClamdClient::new(clamd_url).unwrap().with_timeout(Some(Duration::from_secs(5))));
    let interceptor = ScanInterceptor::new(engine.clone()).with_max_file_size(options.max_file_size);
    let backend = options
        .backend
        .as_deref()
        .map(|url| BackendTarget::from_url(url).unwrap());
    let forwarder = Forwarder::new(Arc::new(interceptor))
        .with_backend(backend)
        .with_memory_threshold(options.memory_threshold)
        .with_scratch_root(options.scratch_root);

    let shutdown = ShutdownCoordinator::spawn(Duration::from_millis(50));
    let listener = BoundListener::bind(&ListenAddress::Tcp("127.0.0.1:0".to_string()), 0o777)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ClammitServer::new(Arc::new(forwarder), engine, shutdown.clone());
    let task = tokio::spawn(server.run(listener));

    RunningProxy {
        url: format!("http://{addr}"),
        addr,
        shutdown,
        task,
    }
}

/// A client that neither follows redirects nor reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// A closed local port, for "backend down" scenarios.
pub async fn closed_port_url(scheme: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("{scheme}://{addr}")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
