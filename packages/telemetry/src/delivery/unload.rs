// packages/telemetry/src/delivery/unload.rs
//! Teardown flush
//!
//! Runs once when the host shuts down. It closes the scheduler through its
//! own guard, so events already in flight are not sent a second time, and
//! hands whatever is still queued to a fire-and-forget transport. There is
//! no retry and no waiting; the outcome is never observed.

use crate::capture::event::Event;
use crate::delivery::scheduler::FlushScheduler;
use crate::delivery::transport::HttpTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Send primitive usable synchronously at teardown
pub trait UnloadTransport: Send + Sync {
    /// Start transmitting `batch` without waiting; true if it was handed off
    fn send_beacon(&self, batch: Vec<Event>) -> bool;
}

/// Beacon posting to the collector on a background task.
///
/// A host that exits right after teardown can [`drain`](HttpBeacon::drain)
/// to let handed-off requests finish.
pub struct HttpBeacon {
    transport: HttpTransport,
    tasks: TaskTracker,
}

impl HttpBeacon {
    pub fn new(transport: HttpTransport) -> Self {
        Self {
            transport,
            tasks: TaskTracker::new(),
        }
    }

    /// Wait up to `timeout` for beacons already handed off.
    ///
    /// Returns true if none are left running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let done = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        if !done {
            warn!("{} unload beacons still running after {:?}", self.tasks.len(), timeout);
        }
        done
    }
}

impl UnloadTransport for HttpBeacon {
    fn send_beacon(&self, batch: Vec<Event>) -> bool {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime at teardown, {} events not sent", batch.len());
                return false;
            }
        };

        let request = match self.transport.build_request(&batch) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to build unload request: {}", e);
                return false;
            }
        };

        let client = self.transport.client();
        let timeout = self.transport.timeout();
        let count = batch.len();

        self.tasks.spawn_on(
            async move {
                match tokio::time::timeout(timeout, client.request(request)).await {
                    Ok(Ok(response)) => debug!("Unload beacon ({} events): {}", count, response.status()),
                    Ok(Err(e)) => debug!("Unload beacon failed: {}", e),
                    Err(_) => debug!("Unload beacon timed out"),
                }
            },
            &handle,
        );
        true
    }
}

/// What the teardown flush did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadReport {
    /// Events handed to the beacon
    pub events: usize,

    /// Whether the beacon accepted them
    pub handed_off: bool,
}

/// One-shot best-effort flush at teardown
pub struct UnloadFlusher {
    scheduler: FlushScheduler,
    beacon: Arc<dyn UnloadTransport>,
    fired: AtomicBool,
}

impl UnloadFlusher {
    pub fn new(scheduler: FlushScheduler, beacon: Arc<dyn UnloadTransport>) -> Self {
        Self {
            scheduler,
            beacon,
            fired: AtomicBool::new(false),
        }
    }

    /// Close the scheduler and beacon out what is left.
    ///
    /// Returns `None` if teardown already ran.
    pub fn flush(&self) -> Option<UnloadReport> {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Unload flush already ran");
            return None;
        }

        let pending = self.scheduler.close();
        if pending.is_empty() {
            debug!("Nothing queued at teardown");
            return Some(UnloadReport {
                events: 0,
                handed_off: false,
            });
        }

        let events = pending.len();
        let handed_off = self.beacon.send_beacon(pending);
        info!("Unload flush handed {} events to beacon (accepted: {})", events, handed_off);

        Some(UnloadReport { events, handed_off })
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
