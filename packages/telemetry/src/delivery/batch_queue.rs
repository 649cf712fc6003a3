// packages/telemetry/src/delivery/batch_queue.rs
//! Bounded FIFO of pending events
//!
//! Every operation is a single critical section, so no drain can observe a
//! half-applied enqueue or requeue and no event lands in two drains.
//!
//! The capacity doubles as the retry-queue cap: when full, the oldest pending
//! events are evicted so fresh captures are never refused.

use crate::capture::event::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Pending event queue
pub struct BatchQueue {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    enqueue_count: AtomicU64,
    drain_count: AtomicU64,
    requeue_count: AtomicU64,
    drop_count: AtomicU64,
}

impl BatchQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            enqueue_count: AtomicU64::new(0),
            drain_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Append an event; returns the evicted oldest event when full
    pub fn enqueue(&self, event: Event) -> Option<Event> {
        let mut events = self.events.lock();

        let evicted = if events.len() >= self.capacity {
            events.pop_front()
        } else {
            None
        };
        events.push_back(event);
        drop(events);

        self.enqueue_count.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = &evicted {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            warn!("Batch queue full, evicted oldest event {}", old.id());
        }
        evicted
    }

    /// Take everything queued, in enqueue order
    pub fn drain_all(&self) -> Vec<Event> {
        let drained: Vec<Event> = self.events.lock().drain(..).collect();
        self.drain_count
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Put failed events back at the head, keeping their relative order.
    ///
    /// Newer events already queued keep their place; if the total would
    /// exceed capacity the oldest requeued events are dropped. Returns the
    /// number dropped.
    pub fn requeue_front(&self, failed: Vec<Event>) -> usize {
        let mut events = self.events.lock();

        let room = self.capacity.saturating_sub(events.len());
        let dropped = failed.len().saturating_sub(room);
        let requeued = failed.len() - dropped;

        for event in failed.into_iter().skip(dropped).rev() {
            events.push_front(event);
        }
        drop(events);

        self.requeue_count
            .fetch_add(requeued as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.drop_count.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    pub fn size(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the queued events, oldest first
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueue_count: self.enqueue_count.load(Ordering::Relaxed),
            drain_count: self.drain_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.size(),
            capacity: self.capacity,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total events enqueued
    pub enqueue_count: u64,

    /// Total events handed out by drains
    pub drain_count: u64,

    /// Total failed events put back at the head
    pub requeue_count: u64,

    /// Events evicted or refused on requeue
    pub drop_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    pub fn drop_rate(&self) -> f64 {
        if self.enqueue_count == 0 {
            0.0
        } else {
            (self.drop_count as f64 / self.enqueue_count as f64) * 100.0
        }
    }
}
