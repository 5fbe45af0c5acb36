//! Scan interceptor.
//!
//! # Responsibilities
//! - Only inspect POST, PUT and PATCH requests
//! - Skip empty bodies and bodies over the configured size limit
//! - Split multipart/form-data bodies into parts, otherwise scan the whole body
//! - Block on the first infected unit, on engine failures and on bad framing
//!
//! # Design Decisions
//! - Units are scanned one after the other in stream order
//! - Oversized bodies pass unscanned (fail open) and are logged as such
//! - Engine details go to the log; callers get a generic 500

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use futures_util::{StreamExt, TryStreamExt};
use mime::Mime;

use crate::body::BodyStream;
use crate::intercept::{Decision, Interceptor, RequestMeta};
use crate::observability::{MetricsReporter, ScanReport, ScanReporter, UnitReport};
use crate::scanner::{ByteSource, ScanEngine, ScanError, ScanStatus};

/// Status returned for infected uploads unless configured otherwise.
pub const DEFAULT_VIRUS_STATUS: StatusCode = StatusCode::IM_A_TEAPOT;

/// Display name for units that carry no filename.
pub const PLACEHOLDER_NAME: &str = "untitled";

/// How the body is split into scan units.
#[derive(Debug, PartialEq, Eq)]
enum Payload {
    Multipart { boundary: String },
    Single { name: String },
}

/// Result of scanning a request's units.
#[derive(Debug)]
enum Verdict {
    Clean,
    Infected { name: String },
    EngineFailure,
    Malformed,
}

enum UnitVerdict {
    Clean,
    Infected,
    Failed,
    Unreadable(io::Error),
}

#[derive(Default)]
struct Tally {
    files: usize,
    viruses: usize,
    failed: bool,
}

/// Interceptor that submits uploaded content to a scan engine.
pub struct ScanInterceptor {
    engine: Arc<dyn ScanEngine>,
    virus_status: StatusCode,
    max_file_size: Option<u64>,
    reporter: Arc<dyn ScanReporter>,
}

impl ScanInterceptor {
    pub fn new(engine: Arc<dyn ScanEngine>) -> Self {
        Self {
            engine,
            virus_status: DEFAULT_VIRUS_STATUS,
            max_file_size: None,
            reporter: Arc::new(MetricsReporter),
        }
    }

    pub fn with_virus_status(mut self, status: StatusCode) -> Self {
        self.virus_status = status;
        self
    }

    /// Bodies declared larger than `limit` are forwarded without scanning.
    pub fn with_max_file_size(mut self, limit: Option<u64>) -> Self {
        self.max_file_size = limit;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ScanReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    async fn scan_multipart(&self, body: BodyStream, boundary: String, tally: &mut Tally) -> Verdict {
        let mut multipart = multer::Multipart::new(body, boundary);
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error parsing multipart form");
                    return Verdict::Malformed;
                }
            };

            let name = field
                .file_name()
                .filter(|n| !n.is_empty())
                .unwrap_or(PLACEHOLDER_NAME)
                .to_string();
            let source = field.map_err(io::Error::other).boxed();

            match self.scan_unit(&name, source, tally).await {
                UnitVerdict::Clean => continue,
                UnitVerdict::Infected => return Verdict::Infected { name },
                UnitVerdict::Failed => return Verdict::EngineFailure,
                UnitVerdict::Unreadable(e) => {
                    tracing::warn!(file = %name, error = %e, "Error reading multipart part");
                    return Verdict::Malformed;
                }
            }
        }
        tracing::debug!("Processed multipart form");
        Verdict::Clean
    }

    async fn scan_single(&self, body: BodyStream, name: String, tally: &mut Tally) -> Verdict {
        match self.scan_unit(&name, body, tally).await {
            UnitVerdict::Clean => Verdict::Clean,
            UnitVerdict::Infected => Verdict::Infected { name },
            UnitVerdict::Failed => Verdict::EngineFailure,
            UnitVerdict::Unreadable(e) => {
                tracing::error!(file = %name, error = %e, "Unable to read captured body");
                Verdict::EngineFailure
            }
        }
    }

    async fn scan_unit(&self, name: &str, source: ByteSource<'_>, tally: &mut Tally) -> UnitVerdict {
        tracing::debug!(file = %name, "Scanning");
        let started = Instant::now();
        let result = self.engine.scan_stream(source).await;
        tally.files += 1;

        let verdict = match result {
            Ok(outcome) => match outcome.status {
                ScanStatus::Clean => UnitVerdict::Clean,
                ScanStatus::Infected => {
                    tally.viruses += 1;
                    tracing::warn!(file = %name, signature = %outcome.description, "Virus found");
                    UnitVerdict::Infected
                }
                ScanStatus::EngineError => {
                    tally.failed = true;
                    tracing::error!(file = %name, reply = %outcome.description, "Unable to scan file");
                    UnitVerdict::Failed
                }
            },
            Err(ScanError::Source(e)) => {
                tally.failed = true;
                UnitVerdict::Unreadable(e)
            }
            Err(e) => {
                tally.failed = true;
                tracing::error!(file = %name, error = %e, "Unable to scan file");
                UnitVerdict::Failed
            }
        };

        self.reporter.report_unit(&UnitReport {
            name,
            duration: started.elapsed(),
            infected: matches!(verdict, UnitVerdict::Infected),
        });
        verdict
    }

    fn respond(&self, verdict: Verdict) -> Decision {
        match verdict {
            Verdict::Clean => Decision::Pass,
            Verdict::Infected { name } => Decision::Block(
                (self.virus_status, format!("File {name} has a virus!")).into_response(),
            ),
            Verdict::EngineFailure => Decision::Block(
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response(),
            ),
            Verdict::Malformed => {
                Decision::Block((StatusCode::BAD_REQUEST, "Bad Request").into_response())
            }
        }
    }
}

#[async_trait]
impl Interceptor for ScanInterceptor {
    async fn handle(&self, request: &RequestMeta, body: BodyStream) -> Decision {
        if !matches!(request.method, Method::POST | Method::PUT | Method::PATCH) {
            return Decision::Pass;
        }

        if let (Some(limit), Some(length)) = (self.max_file_size, request.content_length) {
            if length > limit {
                tracing::info!(size = length, limit, "Not scanning file larger than the limit");
                return Decision::Pass;
            }
        }

        if request.content_length == Some(0) {
            tracing::debug!("Not handling request with zero length");
            return Decision::Pass;
        }

        let size = request.content_length.map_or(-1, |l| l as i64);
        tracing::info!(
            method = %request.method,
            path = %request.uri.path(),
            size,
            size_mb = format_args!("{:.2}", size.max(0) as f64 / 1e6),
            remote_addr = %request.remote_addr,
            forwarded_for = %request.forwarded_for(),
            "New request"
        );

        let started = Instant::now();
        let mut tally = Tally::default();
        let verdict = match classify(&request.headers) {
            Payload::Multipart { boundary } => self.scan_multipart(body, boundary, &mut tally).await,
            Payload::Single { name } => {
                tracing::debug!(file = %name, "Scanning non-multipart file");
                self.scan_single(body, name, &mut tally).await
            }
        };

        self.reporter.report(&ScanReport {
            duration: started.elapsed(),
            failed: tally.failed,
            files: tally.files,
            viruses: tally.viruses,
        });
        self.respond(verdict)
    }
}

fn classify(headers: &HeaderMap) -> Payload {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match content_type.parse::<Mime>() {
        Ok(media) if media.type_() == mime::MULTIPART && media.subtype() == mime::FORM_DATA => {
            match multer::parse_boundary(content_type) {
                Ok(boundary) => return Payload::Multipart { boundary },
                Err(_) => tracing::warn!("Multipart boundary is not defined"),
            }
        }
        Ok(_) => {}
        Err(e) if !content_type.is_empty() => {
            tracing::debug!(content_type, error = %e, "Unable to parse media type");
        }
        Err(_) => {}
    }

    Payload::Single {
        name: disposition_filename(headers).unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
    }
}

/// `filename` parameter of a `Content-Disposition` header.
fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    disposition_params(value)
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("filename"))
        .map(|(_, name)| name)
        .filter(|name| !name.is_empty())
}

/// `key=value` parameters after the disposition type. Quoted values may
/// contain `;` and backslash escapes.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = match value.split_once(';') {
        Some((_, rest)) => rest,
        None => return params,
    };

    while !rest.is_empty() {
        let Some((key, tail)) = rest.split_once('=') else {
            break;
        };
        let key = key.rsplit(';').next().unwrap_or(key).trim().to_string();
        let tail = tail.trim_start();

        let (param, remainder) = match tail.strip_prefix('"') {
            Some(quoted) => {
                let mut param = String::new();
                let mut chars = quoted.char_indices();
                let mut end = quoted.len();
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                param.push(escaped);
                            }
                        }
                        '"' => {
                            end = i + 1;
                            break;
                        }
                        _ => param.push(c),
                    }
                }
                let after = &quoted[end..];
                let remainder = after.split_once(';').map_or("", |(_, r)| r);
                (param, remainder)
            }
            None => match tail.split_once(';') {
                Some((param, r)) => (param.trim().to_string(), r),
                None => (tail.trim().to_string(), ""),
            },
        };

        params.push((key, param));
        rest = remainder;
    }
    params
}
