//! The forwarding pipeline: capture, intercept, replay.
//!
//! # Responsibilities
//! - Capture each request body once into a [`BodyStore`]
//! - Consult the interceptor and honour its blocking decision
//! - Replay clean requests to the resolved backend and relay the response
//! - Release the captured body on every exit path

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::UnixStream;

use crate::body::{BodyStore, BodyStream, DEFAULT_MEMORY_THRESHOLD};
use crate::forward::{BackendTarget, ForwardError};
use crate::intercept::{Decision, Interceptor, RequestMeta, SYNTHETIC_CALLER, X_FORWARDED_FOR};

/// Reply from the scan-only endpoint when nothing was found.
const NO_VIRUS_FOUND: &str = "No virus found";

/// Captures, intercepts and forwards requests.
pub struct Forwarder {
    backend: Option<BackendTarget>,
    interceptor: Arc<dyn Interceptor>,
    memory_threshold: u64,
    scratch_root: Option<PathBuf>,
    client: Client<HttpConnector, Body>,
}

impl Forwarder {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            backend: None,
            interceptor,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            scratch_root: None,
            client,
        }
    }

    /// Static backend. Without one, each request must name its own.
    pub fn with_backend(mut self, backend: Option<BackendTarget>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: u64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn backend(&self) -> Option<&BackendTarget> {
        self.backend.as_ref()
    }

    /// Proxy one request. Never fails; errors become 500/502 responses.
    pub async fn handle_request(&self, request: Request<Body>, remote_addr: &str) -> Response {
        let (meta, store) = match self.capture(request, remote_addr).await {
            Ok(captured) => captured,
            Err(e) => {
                tracing::error!(error = %e, "Unable to save request body");
                return e.into_response();
            }
        };

        let outcome = contain("forwarding", self.dispatch(&meta, &store))
            .await
            .and_then(|dispatched| dispatched);
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    method = %meta.method,
                    path = %meta.uri.path(),
                    "Unable to forward request"
                );
                e.into_response()
            }
        };

        release(store);
        response
    }

    /// Run the interceptor on a request without forwarding it.
    pub async fn inspect(&self, request: Request<Body>, remote_addr: &str) -> Response {
        let (meta, store) = match self.capture(request, remote_addr).await {
            Ok(captured) => captured,
            Err(e) => {
                tracing::error!(error = %e, "Unable to save request body");
                return e.into_response();
            }
        };

        let response = match self.intercept(&meta, &store).await {
            Ok(Decision::Pass) => (StatusCode::OK, NO_VIRUS_FOUND).into_response(),
            Ok(Decision::Block(response)) => response,
            Err(e) => {
                tracing::error!(error = %e, "Scan request failed");
                e.into_response()
            }
        };

        release(store);
        response
    }

    async fn capture(
        &self,
        request: Request<Body>,
        remote_addr: &str,
    ) -> Result<(RequestMeta, BodyStore), ForwardError> {
        let (parts, body) = request.into_parts();
        let meta = RequestMeta::from_parts(&parts, remote_addr);
        let store = BodyStore::capture_in(
            self.scratch_root.as_deref(),
            body.into_data_stream(),
            meta.content_length,
            self.memory_threshold,
        )
        .await?;
        Ok((meta, store))
    }

    async fn intercept(&self, meta: &RequestMeta, store: &BodyStore) -> Result<Decision, ForwardError> {
        let cursor = store.open_cursor().await.map_err(ForwardError::Cursor)?;
        contain("interceptor", self.interceptor.handle(meta, cursor)).await
    }

    async fn dispatch(&self, meta: &RequestMeta, store: &BodyStore) -> Result<Response, ForwardError> {
        if let Decision::Block(response) = self.intercept(meta, store).await? {
            tracing::debug!(status = %response.status(), "Request blocked by interceptor");
            return Ok(response);
        }

        let target = BackendTarget::resolve(self.backend.as_ref(), &meta.headers)?;
        let cursor = store.open_cursor().await.map_err(ForwardError::Cursor)?;
        let outbound = outbound_request(meta, &target, store.content_length(), cursor)?;

        tracing::debug!(
            backend = %target,
            method = %meta.method,
            uri = %outbound.uri(),
            "Forwarding request"
        );

        let response = match &target {
            BackendTarget::Network { .. } => self
                .client
                .request(outbound)
                .await
                .map_err(|e| ForwardError::BackendUnreachable(format!("{target}: {e}")))?
                .map(Body::new),
            BackendTarget::UnixSocket { path } => send_unix(path, outbound).await?,
        };

        tracing::debug!(backend = %target, status = %response.status(), "Backend responded");
        Ok(response)
    }
}

/// Run `future`, turning a panic into [`ForwardError::Fault`].
async fn contain<F: Future>(stage: &'static str, future: F) -> Result<F::Output, ForwardError> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|_| ForwardError::Fault(stage))
}

/// Build the request replayed to `target`.
fn outbound_request(
    meta: &RequestMeta,
    target: &BackendTarget,
    content_length: u64,
    body: BodyStream,
) -> Result<Request<Body>, ForwardError> {
    let mut request = Request::builder()
        .method(meta.method.clone())
        .uri(target.request_uri(&meta.uri)?)
        .body(Body::from_stream(body))?;

    let headers = request.headers_mut();
    for (name, value) in &meta.headers {
        if name == header::HOST || name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(ip) = caller_ip(&meta.remote_addr) {
        let value = HeaderValue::from_str(&ip).map_err(axum::http::Error::from)?;
        headers.append(X_FORWARDED_FOR, value);
    }
    headers.insert(header::HOST, target.host_header()?);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

    Ok(request)
}

/// The caller's IP without its port, or `None` for synthetic callers.
fn caller_ip(remote_addr: &str) -> Option<String> {
    if remote_addr.is_empty() || remote_addr == SYNTHETIC_CALLER {
        return None;
    }
    if let Ok(addr) = remote_addr.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    let host = match remote_addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => remote_addr,
    };
    Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

async fn send_unix(path: &Path, request: Request<Body>) -> Result<Response, ForwardError> {
    let unreachable = |e: &dyn std::fmt::Display| {
        ForwardError::BackendUnreachable(format!("unix:{}: {e}", path.display()))
    };

    let stream = UnixStream::connect(path).await.map_err(|e| unreachable(&e))?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| unreachable(&e))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Backend socket connection closed with error");
        }
    });

    let response = sender.send_request(request).await.map_err(|e| {
        if e.is_incomplete_message() {
            ForwardError::NoResponse
        } else {
            unreachable(&e)
        }
    })?;
    Ok(response.map(Body::new))
}

fn release(store: BodyStore) {
    if let Err(e) = store.release() {
        tracing::warn!(error = %e, "Unable to remove scratch area");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, Method};
    use futures_util::{StreamExt, TryStreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Blocking;

    #[async_trait]
    impl Interceptor for Blocking {
        async fn handle(&self, _request: &RequestMeta, _body: BodyStream) -> Decision {
            Decision::Block((StatusCode::IM_A_TEAPOT, "blocked").into_response())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Interceptor for Panicking {
        async fn handle(&self, _request: &RequestMeta, _body: BodyStream) -> Decision {
            panic!("interceptor exploded");
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for Counting {
        async fn handle(&self, _request: &RequestMeta, body: BodyStream) -> Decision {
            let _ = body.try_collect::<Vec<_>>().await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Decision::Pass
        }
    }

    fn upload(body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn caller_ip_strips_port() {
        assert_eq!(caller_ip("127.0.0.1:5123").as_deref(), Some("127.0.0.1"));
        assert_eq!(caller_ip("[::1]:5123").as_deref(), Some("::1"));
        assert_eq!(caller_ip("10.1.2.3").as_deref(), Some("10.1.2.3"));
        assert_eq!(caller_ip(SYNTHETIC_CALLER), None);
        assert_eq!(caller_ip(""), None);
    }

    #[tokio::test]
    async fn outbound_request_rewrites_headers() {
        let (parts, _) = Request::builder()
            .method(Method::PUT)
            .uri("/files/1?v=2")
            .header(header::HOST, "proxy.example.com")
            .header(header::TRANSFER_ENCODING, "chunked")
            .header(X_FORWARDED_FOR, "203.0.113.9")
            .header("x-custom", "kept")
            .body(())
            .unwrap()
            .into_parts();
        let meta = RequestMeta::from_parts(&parts, "192.0.2.10:40000");
        let target = BackendTarget::from_url("http://127.0.0.1:9000").unwrap();
        let body = futures_util::stream::empty().boxed();

        let request = outbound_request(&meta, &target, 11, body).unwrap();

        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri().to_string(), "http://127.0.0.1:9000/files/1?v=2");
        let headers: &HeaderMap = request.headers();
        assert_eq!(headers[header::HOST], "127.0.0.1:9000");
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers["x-custom"], "kept");
        let chain: Vec<_> = headers.get_all(X_FORWARDED_FOR).iter().collect();
        assert_eq!(chain, vec!["203.0.113.9", "192.0.2.10"]);
    }

    #[tokio::test]
    async fn synthetic_caller_not_appended() {
        let (parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        let meta = RequestMeta::from_parts(&parts, SYNTHETIC_CALLER);
        let target = BackendTarget::from_url("unix:/tmp/backend.sock").unwrap();
        let body = futures_util::stream::empty().boxed();

        let request = outbound_request(&meta, &target, 0, body).unwrap();
        assert!(request.headers().get(X_FORWARDED_FOR).is_none());
        assert_eq!(request.headers()[header::HOST], "localhost");
    }

    #[tokio::test]
    async fn blocked_request_never_reaches_backend() {
        let backend = BackendTarget::from_url(&closed_port().await).unwrap();
        let forwarder = Forwarder::new(Arc::new(Blocking)).with_backend(Some(backend));

        let response = forwarder.handle_request(upload("<virus/>"), "127.0.0.1:1").await;

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(text(response).await, "blocked");
    }

    #[tokio::test]
    async fn interceptor_panic_becomes_500() {
        let forwarder = Forwarder::new(Arc::new(Panicking));
        let response = forwarder.handle_request(upload("data"), "127.0.0.1:1").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn forwarding_panic_becomes_500() {
        let outcome = contain("forwarding", async {
            if true {
                panic!("backend connector exploded");
            }
            Response::new(Body::empty())
        })
        .await;

        let error = outcome.unwrap_err();
        assert!(matches!(error, ForwardError::Fault("forwarding")));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text(response).await, "Internal Server Error");
    }

    #[tokio::test]
    async fn contained_future_passes_output_through() {
        let outcome = contain("forwarding", async { 7 }).await;
        assert_eq!(outcome.unwrap(), 7);
    }

    #[tokio::test]
    async fn length_mismatch_skips_interceptor() {
        let interceptor = Arc::new(Counting::default());
        let forwarder = Forwarder::new(interceptor.clone());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_LENGTH, "10")
            .body(Body::from("abc"))
            .unwrap();

        let response = forwarder.handle_request(request, "127.0.0.1:1").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(interceptor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_backend_is_500() {
        let forwarder = Forwarder::new(Arc::new(Counting::default()));
        let response = forwarder.handle_request(upload("clean"), "127.0.0.1:1").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unreachable_backend_is_502() {
        let backend = BackendTarget::from_url(&closed_port().await).unwrap();
        let forwarder = Forwarder::new(Arc::new(Counting::default())).with_backend(Some(backend));
        let response = forwarder.handle_request(upload("clean"), "127.0.0.1:1").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn disk_capture_cleaned_up_after_request() {
        let root = tempfile::tempdir().unwrap();
        let forwarder = Forwarder::new(Arc::new(Counting::default()))
            .with_memory_threshold(2)
            .with_scratch_root(Some(root.path().to_path_buf()));

        let response = forwarder.inspect(upload("larger than two"), "127.0.0.1:1").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, NO_VIRUS_FOUND);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
