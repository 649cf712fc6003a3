// packages/telemetry/src/main.rs
//! Lingua Telemetry relay
//!
//! Reads JSON lines (`{"type": "...", "properties": {...}}`) from stdin and
//! feeds them through the telemetry pipeline to the configured collector.

use anyhow::Result;
use lingua_telemetry::observability::{init_metrics, init_tracing};
use lingua_telemetry::{
    BuildInfo, HttpBeacon, HttpTransport, Properties, StaticAuth, TelemetryClient, TelemetryConfig, TelemetryDeps,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const USER_ID_ENV: &str = "LINGUA_TELEMETRY_USER_ID";
const TOKEN_ENV: &str = "LINGUA_TELEMETRY_TOKEN";

#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default)]
    properties: Properties,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; it carries the log level
    let config = TelemetryConfig::load()?;

    init_tracing(config.log_level)?;
    let metrics = init_metrics()?;

    let build = BuildInfo::current();
    info!("Starting lingua-telemetry v{} ({})", build.version, build.git_hash);
    debug!("Configuration loaded: {:?}", config);

    let auth = Arc::new(StaticAuth::new());
    if let Ok(user_id) = std::env::var(USER_ID_ENV) {
        auth.sign_in(user_id, std::env::var(TOKEN_ENV).ok());
    }

    // Keep a handle on the beacon so teardown requests can finish before exit
    let beacon = Arc::new(HttpBeacon::new(HttpTransport::new(
        &config.collector.endpoint,
        auth.clone(),
        config.request_timeout(),
    )?));
    let drain_timeout = config.request_timeout();

    let mut deps = TelemetryDeps::from_config(&config, auth)?;
    deps.beacon = beacon.clone();
    let client = TelemetryClient::new(config, deps)?;

    if client.config().collector.push_addr.is_some() {
        client.connect_live()?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => relay(&client, &line),
                None => {
                    info!("Input closed");
                    break;
                }
            },
            _ = &mut shutdown_signal => {
                info!("Received shutdown signal, flushing...");
                break;
            }
        }
    }

    let outcome = client.flush_now().await;
    info!("Final flush: {:?}", outcome);

    if let Some(report) = client.shutdown() {
        debug!("Unload: {:?}", report);
    }
    if !beacon.drain(drain_timeout).await {
        warn!("Exiting with unload beacons still in flight");
    }
    debug!("Metrics:\n{}", metrics.render());

    Ok(())
}

fn relay(client: &TelemetryClient, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<InputLine>(line) {
        Ok(input) => client.track_event(&input.event_type, input.properties),
        Err(e) => warn!("Skipping malformed input line: {}", e),
    }
}
