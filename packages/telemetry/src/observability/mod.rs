// packages/telemetry/src/observability/mod.rs
//! Logging and metrics setup
//!
//! Library code only emits `tracing` events and `metrics` counters; these
//! installers are for the binary or a host that has no subscriber of its own.
//!
//! Counters:
//!
//! - `telemetry_events_captured_total`
//! - `telemetry_events_delivered_total`
//! - `telemetry_events_dropped_total`
//! - `telemetry_flushes_total`
//! - `telemetry_delivery_failures_total`
//! - `telemetry_push_reconnects_total`

use crate::utils::config::LogLevel;
use crate::utils::errors::{Result, TelemetryError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Set to `json` for structured log lines
pub const LOG_FORMAT_ENV: &str = "LINGUA_TELEMETRY_LOG_FORMAT";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level`. Logs go to stderr so stdout stays free for
/// the host.
pub fn init_tracing(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let json = wants_json(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| TelemetryError::Config(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder; render the handle to scrape
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Config(format!("Failed to install metrics recorder: {}", e)))
}

fn default_filter(level: LogLevel) -> String {
    format!("lingua_telemetry={}", level.as_str())
}

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}
