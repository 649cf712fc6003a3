// packages/telemetry/src/delivery/mod.rs
//! Batching and delivery
//!
//! - **BatchQueue**: Bounded, ordered buffer of pending events
//! - **Scheduler**: Size/timer/explicit flush triggers, single flusher
//! - **Transport**: Collector POST with per-request timeout
//! - **Unload**: One-shot beacon of whatever is left at teardown

pub mod batch_queue;
pub mod scheduler;
pub mod transport;
pub mod unload;

pub use batch_queue::{BatchQueue, QueueStats};
pub use scheduler::{FlushOutcome, FlushPolicy, FlushScheduler, FlushState, SchedulerStats};
pub use transport::{HttpTransport, Transport};
pub use unload::{HttpBeacon, UnloadFlusher, UnloadReport, UnloadTransport};
