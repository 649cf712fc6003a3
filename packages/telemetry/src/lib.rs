// packages/telemetry/src/lib.rs
//! Lingua Telemetry Library
//!
//! Client-side telemetry pipeline: captures structured events, batches them
//! in memory, delivers them to a collector with bounded retries, mirrors
//! recent events to a durable store and streams them live.
//!
//! # Architecture
//!
//! - **capture**: Event record, identity resolution, event factory
//! - **delivery**: Batch queue, flush scheduler, HTTP transport, unload flush
//! - **storage**: Key/value stores and the durability ring buffer
//! - **live**: Local event bus and the reconnecting push channel
//! - **client**: Facade wiring one instance of every component
//! - **observability**: Tracing subscriber and metrics recorder setup
//! - **utils**: Configuration, errors, clock

pub mod capture;
pub mod client;
pub mod delivery;
pub mod live;
pub mod observability;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use capture::{event_types, AuthState, Event, Properties, StaticAuth};
pub use client::{TelemetryClient, TelemetryDeps, TelemetryStats};
pub use delivery::{FlushOutcome, HttpBeacon, HttpTransport, Transport, UnloadTransport};
pub use live::{ChannelState, PushConnector};
pub use storage::{DurableStore, MemoryStore, SqliteStore};
pub use utils::config::TelemetryConfig;
pub use utils::errors::{Result, TelemetryError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Library build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
