// packages/telemetry/src/utils/clock.rs
//! Wall-clock source for event timestamps
//!
//! Timers (flush delay, retry and reconnect backoff) run on `tokio::time`
//! and can be paused in tests; wall-clock instants go through [`Clock`].

use chrono::{DateTime, Utc};

/// Source of capture-time instants
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
