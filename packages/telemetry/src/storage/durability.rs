// packages/telemetry/src/storage/durability.rs
//! Bounded mirror of recent events
//!
//! Keeps the N most recent captured events in a [`DurableStore`] so a crash
//! or an offline period leaves something to inspect or replay. This is a
//! diagnostic log, not the delivery retry queue: writes are best effort and
//! failures are only logged.
//!
//! `record` and `prune` only touch the in-memory ring. A background writer
//! persists the ring after changes, coalescing bursts into one store write.
//! Outside a tokio runtime the write happens inline. [`DurabilityBuffer::flush`]
//! forces a pending write, and dropping the buffer does the same.

use crate::capture::event::Event;
use crate::storage::store::DurableStore;
use crate::utils::errors::TelemetryError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const BUFFER_KEY: &str = "lingua.telemetry.buffer";

struct Shared {
    store: Arc<dyn DurableStore>,
    ring: Mutex<VecDeque<Event>>,
    dirty: AtomicBool,
    /// Serializes store writes so an older snapshot never lands last
    write_lock: Mutex<()>,
    wake: Notify,
}

/// Ring buffer of recent events persisted under a single key
pub struct DurabilityBuffer {
    shared: Arc<Shared>,
    capacity: usize,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DurabilityBuffer {
    /// Create the buffer, loading whatever a previous process left behind
    pub fn new(store: Arc<dyn DurableStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut ring = load(store.as_ref());
        while ring.len() > capacity {
            ring.pop_front();
        }

        if !ring.is_empty() {
            debug!("Loaded {} buffered events", ring.len());
        }

        Self {
            shared: Arc::new(Shared {
                store,
                ring: Mutex::new(ring),
                dirty: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                wake: Notify::new(),
            }),
            capacity,
            writer: Mutex::new(None),
        }
    }

    /// Mirror an event, evicting the oldest beyond capacity
    pub fn record(&self, event: &Event) {
        {
            let mut ring = self.shared.ring.lock();
            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        self.schedule_write();
    }

    /// Up to `n` most recent events, oldest first
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let ring = self.shared.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Remove delivered events by id
    pub fn prune(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let delivered: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let changed = {
            let mut ring = self.shared.ring.lock();
            let before = ring.len();
            ring.retain(|e| !delivered.contains(e.id()));
            ring.len() != before
        };
        if changed {
            self.schedule_write();
        }
    }

    pub fn clear(&self) {
        let _write = self.shared.write_lock.lock();
        self.shared.ring.lock().clear();
        self.shared.dirty.store(false, Ordering::SeqCst);
        if let Err(e) = self.shared.store.remove(BUFFER_KEY) {
            warn!("Failed to clear durability buffer: {}", e);
        }
    }

    /// Write the ring now if it changed since the last write
    pub fn flush(&self) {
        self.shared.persist();
    }

    pub fn len(&self) -> usize {
        self.shared.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn schedule_write(&self) {
        self.shared.dirty.store(true, Ordering::SeqCst);

        let mut writer = self.writer.lock();
        if writer.as_ref().is_some_and(|w| !w.is_finished()) {
            self.shared.wake.notify_one();
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                *writer = Some(handle.spawn(write_loop(shared)));
                self.shared.wake.notify_one();
            }
            Err(_) => {
                drop(writer);
                self.shared.persist();
            }
        }
    }
}

impl Drop for DurabilityBuffer {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        self.shared.persist();
    }
}

impl Shared {
    fn persist(&self) {
        let _write = self.write_lock.lock();
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let encoded = serde_json::to_string(&*self.ring.lock());
        let result = encoded
            .map_err(TelemetryError::from)
            .and_then(|json| self.store.set(BUFFER_KEY, &json));

        if let Err(e) = result {
            warn!("Failed to persist durability buffer: {}", e);
        }
    }
}

async fn write_loop(shared: Arc<Shared>) {
    loop {
        shared.wake.notified().await;
        if !shared.dirty.load(Ordering::SeqCst) {
            continue;
        }

        let job = Arc::clone(&shared);
        if let Err(e) = tokio::task::spawn_blocking(move || job.persist()).await {
            warn!("Durability write task failed: {}", e);
        }
    }
}

fn load(store: &dyn DurableStore) -> VecDeque<Event> {
    let raw = match store.get(BUFFER_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return VecDeque::new(),
        Err(e) => {
            warn!("Durability buffer unavailable: {}", e);
            return VecDeque::new();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(events) => events,
        Err(e) => {
            warn!("Discarding corrupt durability buffer: {}", e);
            VecDeque::new()
        }
    }
}
