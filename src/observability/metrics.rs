//! Scan metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the reporting interface the scan interceptor talks to
//! - Record scan counters and durations through the `metrics` facade
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `clammit_scan_requests_total` (counter): intercepted requests
//! - `clammit_scan_failed_total` (counter): requests whose scan failed
//! - `clammit_files_scanned_total` (counter): units submitted to the engine
//! - `clammit_viruses_found_total` (counter): infected units
//! - `clammit_scan_duration_seconds` (histogram): per-request scan time
//! - `clammit_file_scan_duration_seconds` (histogram): per-unit scan time

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Summary of one intercepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub duration: Duration,
    pub failed: bool,
    pub files: usize,
    pub viruses: usize,
}

/// Timing of one scanned unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitReport<'a> {
    pub name: &'a str,
    pub duration: Duration,
    pub infected: bool,
}

/// Sink for scan statistics.
pub trait ScanReporter: Send + Sync {
    fn report(&self, report: &ScanReport);

    fn report_unit(&self, _unit: &UnitReport<'_>) {}
}

/// Reporter backed by the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsReporter;

impl ScanReporter for MetricsReporter {
    fn report(&self, report: &ScanReport) {
        counter!("clammit_scan_requests_total").increment(1);
        if report.failed {
            counter!("clammit_scan_failed_total").increment(1);
        }
        counter!("clammit_files_scanned_total").increment(report.files as u64);
        counter!("clammit_viruses_found_total").increment(report.viruses as u64);
        histogram!("clammit_scan_duration_seconds").record(report.duration.as_secs_f64());
    }

    fn report_unit(&self, unit: &UnitReport<'_>) {
        let result = if unit.infected { "infected" } else { "scanned" };
        histogram!("clammit_file_scan_duration_seconds", "result" => result)
            .record(unit.duration.as_secs_f64());
    }
}

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}
