// packages/telemetry/src/delivery/scheduler.rs
//! Flush scheduling and delivery
//!
//! Decides when the batch queue is drained and hands the batch to the
//! transport. At most one flush is in flight at any time.
//!
//! # State machine
//!
//! ```text
//!            enqueue (< batch_size)              timer fires
//!   Idle ─────────────────────────▶ Scheduled ─────────────────▶ Flushing
//!    │                                  │                           │
//!    │ enqueue (>= batch_size)          │ enqueue (>= batch_size)   │ delivered, or
//!    └──────────────────────────────────┴─────────────▶ Flushing    │ attempts exhausted
//!                                                                   ▼
//!                                                        Idle (re-evaluated)
//!
//!   close() from any state ──▶ Closed
//! ```
//!
//! The drain happens synchronously in the call that triggers the flush, so a
//! threshold flush carries exactly the events queued at that moment. Events
//! captured while a flush is in flight wait for the next one. `flush_now()`
//! during a flush joins it instead of starting a second send.
//!
//! A failed batch is retried as-is (same ids, same order) up to
//! `max_attempts` with exponential backoff, then put back at the head of the
//! queue. Errors that cannot succeed on retry (see
//! [`is_retryable`](crate::TelemetryError::is_retryable)) skip the remaining attempts. The queue's
//! capacity bounds what survives a sustained outage.
//!
//! If the delivery task dies before settling (a panicking transport), its
//! batch is dropped and counted, and the scheduler goes back to `Idle`.

use crate::capture::event::Event;
use crate::delivery::batch_queue::BatchQueue;
use crate::delivery::transport::Transport;
use crate::storage::durability::DurabilityBuffer;
use crate::utils::config::TelemetryConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Scheduled,
    Flushing,
    Closed,
}

/// Result of an explicit flush request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,

    /// Batch acknowledged by the collector
    Delivered(usize),

    /// Attempts exhausted; events went back to the queue
    Requeued { requeued: usize, dropped: usize },

    /// Another flush was in flight; waited for it to settle
    Joined,

    /// Delivery task died before settling; its batch was dropped
    Aborted,

    /// Scheduler already closed
    Closed,
}

/// Timing and retry knobs
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub prune_delivered: bool,
}

impl FlushPolicy {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            batch_size: config.batching.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_attempts: config.delivery.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.delivery.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.delivery.retry_max_delay_ms),
            prune_delivered: config.durability.prune_delivered,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

enum Phase {
    Idle,
    Scheduled { generation: u64, timer: JoinHandle<()> },
    Flushing,
    Closed,
}

impl Phase {
    fn state(&self) -> FlushState {
        match self {
            Phase::Idle => FlushState::Idle,
            Phase::Scheduled { .. } => FlushState::Scheduled,
            Phase::Flushing => FlushState::Flushing,
            Phase::Closed => FlushState::Closed,
        }
    }
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub flushes_started: u64,
    pub batches_delivered: u64,
    pub events_delivered: u64,
    pub failed_attempts: u64,
    pub batches_requeued: u64,
    pub events_dropped: u64,
}

#[derive(Default)]
struct Counters {
    flushes_started: AtomicU64,
    batches_delivered: AtomicU64,
    events_delivered: AtomicU64,
    failed_attempts: AtomicU64,
    batches_requeued: AtomicU64,
    events_dropped: AtomicU64,
}

struct Inner {
    queue: Arc<BatchQueue>,
    transport: Arc<dyn Transport>,
    durability: Option<Arc<DurabilityBuffer>>,
    policy: FlushPolicy,
    phase: Mutex<Phase>,
    timer_generation: AtomicU64,
    settled: watch::Sender<u64>,
    counters: Counters,
}

/// Single-flusher batch scheduler
#[derive(Clone)]
pub struct FlushScheduler {
    inner: Arc<Inner>,
}

impl FlushScheduler {
    pub fn new(
        queue: Arc<BatchQueue>,
        transport: Arc<dyn Transport>,
        durability: Option<Arc<DurabilityBuffer>>,
        policy: FlushPolicy,
    ) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queue,
                transport,
                durability,
                policy,
                phase: Mutex::new(Phase::Idle),
                timer_generation: AtomicU64::new(0),
                settled,
                counters: Counters::default(),
            }),
        }
    }

    /// Queue an event and apply the size/timer triggers. Never blocks.
    pub fn enqueue(&self, event: Event) {
        let mut phase = self.inner.phase.lock();
        if matches!(*phase, Phase::Closed) {
            debug!("Scheduler closed, ignoring event {}", event.id());
            return;
        }

        if self.inner.queue.enqueue(event).is_some() {
            self.inner.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("telemetry_events_dropped_total").increment(1);
        }

        Inner::evaluate(&self.inner, &mut phase, true);
    }

    /// Flush immediately, or join the flush already in flight
    pub async fn flush_now(&self) -> FlushOutcome {
        let mut settled = self.inner.settled.subscribe();

        let batch = {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Closed => return FlushOutcome::Closed,
                Phase::Flushing => None,
                _ if self.inner.queue.is_empty() => return FlushOutcome::Empty,
                _ => Some(Inner::begin_flush(&self.inner, &mut phase)),
            }
        };

        match batch {
            Some(batch) => {
                let inner = Arc::clone(&self.inner);
                // Spawned so a dropped caller cannot cancel an in-flight send.
                match tokio::spawn(Inner::deliver(inner, batch)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Flush task failed: {}", e);
                        FlushOutcome::Aborted
                    }
                }
            }
            None => {
                debug!("Flush already in flight, joining");
                let _ = settled.changed().await;
                FlushOutcome::Joined
            }
        }
    }

    /// Stop scheduling and hand back everything queued but not in flight.
    ///
    /// Cancels any armed timer. A flush already in flight finishes on its
    /// own; if it fails its batch is dropped rather than requeued.
    pub fn close(&self) -> Vec<Event> {
        let mut phase = self.inner.phase.lock();
        if let Phase::Scheduled { timer, .. } = &*phase {
            timer.abort();
        }
        *phase = Phase::Closed;
        self.inner.queue.drain_all()
    }

    pub fn state(&self) -> FlushState {
        self.inner.phase.lock().state()
    }

    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.inner.queue
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.inner.policy
    }

    /// Resolves after the next in-flight flush settles
    pub fn settled(&self) -> watch::Receiver<u64> {
        self.inner.settled.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            flushes_started: c.flushes_started.load(Ordering::Relaxed),
            batches_delivered: c.batches_delivered.load(Ordering::Relaxed),
            events_delivered: c.events_delivered.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            batches_requeued: c.batches_requeued.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    /// Apply triggers while holding the phase lock.
    ///
    /// `allow_immediate` is false right after a failed delivery so a full
    /// queue waits for the timer instead of hammering the collector.
    fn evaluate(this: &Arc<Self>, phase: &mut Phase, allow_immediate: bool) {
        if matches!(*phase, Phase::Flushing | Phase::Closed) {
            return;
        }

        let size = this.queue.size();
        if size == 0 {
            return;
        }

        if allow_immediate && size >= this.policy.batch_size {
            let handle = match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    warn!("No async runtime, {} events wait for an explicit flush", size);
                    return;
                }
            };
            debug!("Queue reached {} events, flushing", size);
            let batch = Self::begin_flush(this, phase);
            handle.spawn(Self::deliver(Arc::clone(this), batch));
            return;
        }

        if matches!(*phase, Phase::Idle) {
            Self::arm_timer(this, phase);
        }
    }

    fn arm_timer(this: &Arc<Self>, phase: &mut Phase) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, flush timer not armed");
                return;
            }
        };

        let generation = this.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = this.policy.flush_interval;
        let inner = Arc::clone(this);

        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::timer_fired(&inner, generation);
        });

        *phase = Phase::Scheduled { generation, timer };
    }

    fn timer_fired(this: &Arc<Self>, generation: u64) {
        let mut phase = this.phase.lock();
        match &*phase {
            Phase::Scheduled { generation: current, .. } if *current == generation => {}
            _ => return,
        }

        // Leave the timer's own handle un-aborted; this task is it.
        *phase = Phase::Idle;
        if this.queue.is_empty() {
            return;
        }

        debug!("Flush timer fired");
        let batch = Self::begin_flush(this, &mut phase);
        tokio::spawn(Self::deliver(Arc::clone(this), batch));
    }

    /// Enter `Flushing` and take the batch. Caller holds the phase lock.
    fn begin_flush(this: &Arc<Self>, phase: &mut Phase) -> Vec<Event> {
        if let Phase::Scheduled { timer, .. } = &*phase {
            timer.abort();
        }
        *phase = Phase::Flushing;

        this.counters.flushes_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("telemetry_flushes_total").increment(1);
        this.queue.drain_all()
    }

    async fn deliver(this: Arc<Self>, batch: Vec<Event>) -> FlushOutcome {
        let count = batch.len();
        let max_attempts = this.policy.max_attempts;
        let mut guard = SettleGuard {
            inner: &this,
            events: count,
            armed: true,
        };

        for attempt in 1..=max_attempts {
            match this.transport.send(&batch).await {
                Ok(()) => {
                    this.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
                    this.counters
                        .events_delivered
                        .fetch_add(count as u64, Ordering::Relaxed);
                    metrics::counter!("telemetry_events_delivered_total").increment(count as u64);
                    debug!("Flushed {} events (attempt {})", count, attempt);

                    if this.policy.prune_delivered {
                        if let Some(buffer) = &this.durability {
                            let ids: Vec<String> = batch.iter().map(|e| e.id().to_string()).collect();
                            buffer.prune(&ids);
                        }
                    }

                    guard.armed = false;
                    this.settle(None);
                    return FlushOutcome::Delivered(count);
                }
                Err(e) => {
                    this.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("telemetry_delivery_failures_total").increment(1);
                    warn!(
                        attempt,
                        max_attempts,
                        events = count,
                        "Batch delivery failed: {}",
                        e
                    );

                    if !e.is_retryable() {
                        debug!("Error is not retryable, skipping remaining attempts");
                        break;
                    }
                    if attempt < max_attempts {
                        tokio::time::sleep(this.policy.retry_delay(attempt)).await;
                    }
                }
            }
        }

        guard.armed = false;
        this.settle(Some(batch))
    }

    /// Leave `Flushing` after the delivery task died mid-flight
    fn abandon(self: &Arc<Self>, events: usize) {
        let mut phase = self.phase.lock();
        self.counters
            .events_dropped
            .fetch_add(events as u64, Ordering::Relaxed);
        metrics::counter!("telemetry_events_dropped_total").increment(events as u64);
        error!("Delivery ended without settling, dropped {} events", events);

        if matches!(*phase, Phase::Flushing) {
            *phase = Phase::Idle;
            Self::evaluate(self, &mut phase, false);
        }
        drop(phase);

        self.settled.send_modify(|n| *n += 1);
    }

    /// Leave `Flushing`, requeueing a failed batch first
    fn settle(self: &Arc<Self>, failed: Option<Vec<Event>>) -> FlushOutcome {
        let mut phase = self.phase.lock();
        let succeeded = failed.is_none();

        let outcome = match failed {
            None => FlushOutcome::Empty,
            Some(batch) => {
                let total = batch.len();
                let dropped = if matches!(*phase, Phase::Closed) {
                    total
                } else {
                    self.queue.requeue_front(batch)
                };

                self.counters.batches_requeued.fetch_add(1, Ordering::Relaxed);
                if dropped > 0 {
                    self.counters
                        .events_dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    metrics::counter!("telemetry_events_dropped_total").increment(dropped as u64);
                    warn!("Dropped {} undeliverable events over the queue cap", dropped);
                }
                info!(
                    "Delivery attempts exhausted, requeued {} events",
                    total - dropped
                );

                FlushOutcome::Requeued {
                    requeued: total - dropped,
                    dropped,
                }
            }
        };

        if matches!(*phase, Phase::Flushing) {
            *phase = Phase::Idle;
            Self::evaluate(self, &mut phase, succeeded);
        }
        drop(phase);

        self.settled.send_modify(|n| *n += 1);
        outcome
    }
}

/// Settles the scheduler if `deliver` unwinds or is cancelled
struct SettleGuard<'a> {
    inner: &'a Arc<Inner>,
    events: usize,
    armed: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon(self.events);
        }
    }
}
