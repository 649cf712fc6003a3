// packages/telemetry/src/utils/mod.rs
//! Common utilities and helpers
//!
//! - **config**: Layered configuration (defaults, file, environment)
//! - **errors**: Crate error taxonomy
//! - **clock**: Wall-clock abstraction for event timestamps

pub mod clock;
pub mod config;
pub mod errors;

pub use clock::{Clock, SystemClock};
pub use config::TelemetryConfig;
pub use errors::{Result, TelemetryError};
