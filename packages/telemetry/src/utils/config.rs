// packages/telemetry/src/utils/config.rs
//! Layered configuration
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. `lingua-telemetry.toml` in the working directory, or the file named by
//!    `LINGUA_TELEMETRY_CONFIG`
//! 3. Environment variables, e.g. `LINGUA_TELEMETRY__BATCHING__BATCH_SIZE=50`

use crate::utils::errors::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "lingua-telemetry";
const CONFIG_PATH_ENV: &str = "LINGUA_TELEMETRY_CONFIG";
const ENV_PREFIX: &str = "LINGUA_TELEMETRY";

/// Top-level telemetry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub collector: CollectorConfig,
    pub batching: BatchingConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub durability: DurabilityConfig,
    pub live: LiveConfig,
    pub client: ClientConfig,

    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: LogLevel,
}

/// Collector endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Batch endpoint (`POST` JSON array)
    pub endpoint: String,

    /// Push channel address (`host:port`), disabled when unset
    pub push_addr: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3001/api/analytics/events".to_string(),
            push_addr: None,
        }
    }
}

/// Flush timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Queue size that triggers an immediate flush
    pub batch_size: usize,

    /// Delay before a timer-driven flush (milliseconds)
    pub flush_interval_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 5_000,
        }
    }
}

/// Pending queue bound
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum retained events, including requeued failures.
    /// Defaults to twice the batch size when unset.
    pub max_size: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: None }
    }
}

/// Delivery retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Send attempts per flush before the batch is requeued
    pub max_attempts: u32,

    /// Per-attempt deadline (milliseconds)
    pub request_timeout_ms: u64,

    /// First retry delay (milliseconds), doubled per attempt
    pub retry_base_delay_ms: u64,

    /// Retry delay ceiling (milliseconds)
    pub retry_max_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            request_timeout_ms: 10_000,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
        }
    }
}

/// Local durability buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    /// Most recent events retained
    pub capacity: usize,

    /// Drop delivered events from the buffer
    pub prune_delivered: bool,

    /// Re-enqueue buffered events at startup; requires `prune_delivered`
    pub recover_on_start: bool,

    /// SQLite file backing the durable store (binary only)
    pub db_path: PathBuf,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            prune_delivered: true,
            recover_on_start: false,
            db_path: PathBuf::from("lingua-telemetry.db"),
        }
    }
}

/// Live push channel and local bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Local broadcast capacity; slow subscribers lag past this
    pub bus_capacity: usize,

    /// Outbound frames buffered while the socket is busy
    pub outbound_capacity: usize,

    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 256,
            outbound_capacity: 256,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

/// Client context stamped into event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub sdk_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!(
                "lingua-telemetry/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config: TelemetryConfig = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batching.batch_size == 0 {
            return Err(TelemetryError::Config("batching.batch_size must be > 0".to_string()));
        }

        if self.queue_capacity() < self.batching.batch_size {
            return Err(TelemetryError::Config(format!(
                "queue.max_size ({}) must be >= batching.batch_size ({})",
                self.queue_capacity(),
                self.batching.batch_size
            )));
        }

        if self.delivery.max_attempts == 0 {
            return Err(TelemetryError::Config("delivery.max_attempts must be >= 1".to_string()));
        }

        if self.durability.capacity == 0 {
            return Err(TelemetryError::Config("durability.capacity must be >= 1".to_string()));
        }

        // Without pruning the ring still holds acknowledged events.
        if self.durability.recover_on_start && !self.durability.prune_delivered {
            return Err(TelemetryError::Config(
                "durability.recover_on_start requires durability.prune_delivered".to_string(),
            ));
        }

        if self.live.bus_capacity == 0 || self.live.outbound_capacity == 0 {
            return Err(TelemetryError::Config("live channel capacities must be >= 1".to_string()));
        }

        self.collector
            .endpoint
            .parse::<hyper::Uri>()
            .map_err(|e| TelemetryError::Config(format!("collector.endpoint: {}", e)))?;

        Ok(())
    }

    /// Effective retry-queue cap
    pub fn queue_capacity(&self) -> usize {
        self.queue
            .max_size
            .unwrap_or(self.batching.batch_size.saturating_mul(2))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batching.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.request_timeout_ms)
    }
}
