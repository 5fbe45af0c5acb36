//! Handlers under `/clammit`.
//!
//! - `GET /clammit`: engine reachability, version and two test scans
//! - `POST /clammit/scan`: run the interceptor without forwarding
//! - `GET /clammit/readyz`: 503 once shutdown has begun

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::http::server::{remote_addr, AppState};
use crate::scanner::ScanEngine;

/// The standard antivirus test string.
pub const EICAR: &[u8] = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

const CLEAN_SAMPLE: &[u8] = b"foo bar mcgrew";

/// Body of `GET /clammit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub clammit_version: String,
    pub scan_server_url: String,
    pub ping_result: String,
    pub scan_server_version: String,
    pub test_scan_virus: String,
    pub test_scan_clean: String,
}

impl ServerInfo {
    /// Probe `engine` and collect the results.
    pub async fn collect(engine: &dyn ScanEngine) -> Self {
        let mut info = ServerInfo {
            clammit_version: env!("CARGO_PKG_VERSION").to_string(),
            scan_server_url: engine.address().to_string(),
            ..Default::default()
        };

        if let Err(e) = engine.probe_liveness().await {
            info.ping_result = e.to_string();
            return info;
        }
        info.ping_result = "Connected to server OK".to_string();
        info.scan_server_version = engine
            .report_version()
            .await
            .unwrap_or_else(|e| e.to_string());
        info.test_scan_virus = test_scan(engine, EICAR).await;
        info.test_scan_clean = test_scan(engine, CLEAN_SAMPLE).await;
        info
    }
}

async fn test_scan(engine: &dyn ScanEngine, sample: &'static [u8]) -> String {
    let source = stream::once(async move { Ok(Bytes::from_static(sample)) }).boxed();
    match engine.scan_stream(source).await {
        Ok(outcome) => outcome.to_string(),
        Err(e) => e.to_string(),
    }
}

pub async fn info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo::collect(state.engine.as_ref()).await)
}

pub async fn scan(State(state): State<AppState>, request: Request<Body>) -> Response {
    let remote = remote_addr(&request);
    state.forwarder.inspect(request, &remote).await
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    match state.shutdown.snapshot().await {
        Some(snapshot) if snapshot.accepting => StatusCode::OK.into_response(),
        _ => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
