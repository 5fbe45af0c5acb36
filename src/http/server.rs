//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router: diagnostics under `/clammit`, everything else proxied
//! - Register every tracked request with the shutdown coordinator
//! - Wire up middleware (request ID, tracing)
//! - Serve on a TCP or Unix listener until the coordinator closes

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::forward::Forwarder;
use crate::http::diagnostics;
use crate::intercept::SYNTHETIC_CALLER;
use crate::lifecycle::ShutdownHandle;
use crate::net::{BoundListener, PeerAddr};
use crate::scanner::ScanEngine;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Arc<Forwarder>,
    pub engine: Arc<dyn ScanEngine>,
    pub shutdown: ShutdownHandle,
}

/// The clammit HTTP server.
pub struct ClammitServer {
    state: AppState,
}

impl ClammitServer {
    pub fn new(forwarder: Arc<Forwarder>, engine: Arc<dyn ScanEngine>, shutdown: ShutdownHandle) -> Self {
        Self {
            state: AppState {
                forwarder,
                engine,
                shutdown,
            },
        }
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        let tracked = Router::new()
            .route("/clammit", get(diagnostics::info))
            .route("/clammit/scan", post(diagnostics::scan))
            .fallback(proxy_handler)
            .layer(middleware::from_fn_with_state(self.state.clone(), track_activity));

        let untracked = Router::new().route("/clammit/readyz", get(diagnostics::readyz));

        tracked
            .merge(untracked)
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Serve until the shutdown coordinator reports the drain is complete.
    pub async fn run(self, listener: BoundListener) -> Result<(), io::Error> {
        let app = self.router();
        let shutdown = self.state.shutdown.clone();
        let closed = async move { shutdown.closed().await };

        match listener {
            BoundListener::Tcp(listener) => {
                tracing::info!(address = ?listener.local_addr().ok(), "HTTP server starting");
                axum::serve(listener, app.into_make_service_with_connect_info::<PeerAddr>())
                    .with_graceful_shutdown(closed)
                    .await?;
            }
            BoundListener::Unix { listener, path } => {
                tracing::info!(path = %path.display(), "HTTP server starting");
                let served = axum::serve(listener, app.into_make_service_with_connect_info::<PeerAddr>())
                    .with_graceful_shutdown(closed)
                    .await;
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Unable to remove socket file");
                }
                served?;
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Caller address of `request`, or `@` when none was recorded.
pub(crate) fn remote_addr(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<PeerAddr>>()
        .map(|ConnectInfo(PeerAddr(addr))| addr.clone())
        .unwrap_or_else(|| SYNTHETIC_CALLER.to_string())
}

/// Rejects requests with 503 once shutdown has begun.
async fn track_activity(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(_activity) = state.shutdown.enter().await else {
        tracing::warn!(path = %request.uri().path(), "Rejecting request, shutting down");
        return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response();
    };
    next.run(request).await
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let remote = remote_addr(&request);
    state.forwarder.handle_request(request, &remote).await
}
