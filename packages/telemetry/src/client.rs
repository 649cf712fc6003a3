// packages/telemetry/src/client.rs
//! Telemetry client facade
//!
//! Owns one instance of every pipeline component. Nothing here is global:
//! two clients built from separate dependencies share no state.
//!
//! Capture path, all synchronous:
//!
//! ```text
//! track_* ─▶ EventFactory ─▶ DurabilityBuffer.record
//!                          ─▶ LivePushChannel.stream (if connected)
//!                          ─▶ EventBus.publish
//!                          ─▶ FlushScheduler.enqueue ─▶ (spawned) Transport
//! ```

use crate::capture::event::{event_types, Event, Properties};
use crate::capture::factory::{EventFactory, PageContext};
use crate::capture::identity::{AuthState, IdentityResolver};
use crate::delivery::batch_queue::{BatchQueue, QueueStats};
use crate::delivery::scheduler::{FlushOutcome, FlushPolicy, FlushScheduler, FlushState, SchedulerStats};
use crate::delivery::transport::{HttpTransport, Transport};
use crate::delivery::unload::{HttpBeacon, UnloadFlusher, UnloadReport, UnloadTransport};
use crate::live::bus::EventBus;
use crate::live::channel::{ChannelState, LivePushChannel, ReconnectPolicy};
use crate::live::connection::{PushConnector, TcpConnector};
use crate::storage::durability::DurabilityBuffer;
use crate::storage::store::{DurableStore, MemoryStore, SqliteStore};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::config::TelemetryConfig;
use crate::utils::errors::{Result, TelemetryError};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Injected collaborators
pub struct TelemetryDeps {
    pub transport: Arc<dyn Transport>,
    pub beacon: Arc<dyn UnloadTransport>,

    /// Scope of the session id; cleared when the session ends
    pub session_store: Arc<dyn DurableStore>,

    /// Holds the anonymous id and the durability ring
    pub durable_store: Arc<dyn DurableStore>,

    pub auth: Arc<dyn AuthState>,
    pub clock: Arc<dyn Clock>,
    pub push_connector: Option<Arc<dyn PushConnector>>,
}

impl TelemetryDeps {
    /// Production wiring: HTTP delivery, SQLite durable store, process-scoped
    /// session store and a TCP push connector when `collector.push_addr` is set
    pub fn from_config(config: &TelemetryConfig, auth: Arc<dyn AuthState>) -> Result<Self> {
        let http = HttpTransport::new(&config.collector.endpoint, auth.clone(), config.request_timeout())?;
        let durable_store = Arc::new(SqliteStore::open(&config.durability.db_path)?);

        let push_connector = config.collector.push_addr.as_ref().map(|addr| {
            Arc::new(TcpConnector::new(addr.clone(), config.request_timeout())) as Arc<dyn PushConnector>
        });

        Ok(Self {
            transport: Arc::new(http.clone()),
            beacon: Arc::new(HttpBeacon::new(http)),
            session_store: Arc::new(MemoryStore::new()),
            durable_store,
            auth,
            clock: Arc::new(SystemClock),
            push_connector,
        })
    }
}

/// Combined pipeline counters
#[derive(Debug, Clone)]
pub struct TelemetryStats {
    pub queue: QueueStats,
    pub scheduler: SchedulerStats,
    pub buffered: usize,
    pub published: u64,
}

/// Client telemetry pipeline
pub struct TelemetryClient {
    config: TelemetryConfig,
    identity: Arc<IdentityResolver>,
    factory: EventFactory,
    scheduler: FlushScheduler,
    durability: Arc<DurabilityBuffer>,
    bus: Arc<EventBus>,
    channel: Option<LivePushChannel>,
    unload: UnloadFlusher,
}

impl TelemetryClient {
    pub fn new(config: TelemetryConfig, deps: TelemetryDeps) -> Result<Self> {
        config.validate()?;

        let identity = Arc::new(IdentityResolver::new(
            deps.session_store,
            deps.durable_store.clone(),
            deps.auth,
        ));
        let factory = EventFactory::new(identity.clone(), deps.clock, config.client.clone());

        let durability = Arc::new(DurabilityBuffer::new(
            deps.durable_store,
            config.durability.capacity,
        ));

        let queue = Arc::new(BatchQueue::new(config.queue_capacity()));
        let scheduler = FlushScheduler::new(
            queue,
            deps.transport,
            Some(durability.clone()),
            FlushPolicy::from_config(&config),
        );

        let bus = Arc::new(EventBus::new(config.live.bus_capacity));
        let channel = deps.push_connector.map(|connector| {
            LivePushChannel::with_bus(connector, ReconnectPolicy::from_config(&config.live), bus.clone())
        });

        let unload = UnloadFlusher::new(scheduler.clone(), deps.beacon);

        info!(
            endpoint = %config.collector.endpoint,
            batch_size = config.batching.batch_size,
            flush_interval_ms = config.batching.flush_interval_ms,
            live = channel.is_some(),
            "Telemetry client initialized"
        );

        let client = Self {
            config,
            identity,
            factory,
            scheduler,
            durability,
            bus,
            channel,
            unload,
        };

        if client.config.durability.recover_on_start {
            client.recover_unsent();
        }

        Ok(client)
    }

    /// Record a custom event
    pub fn track_event(&self, event_type: &str, properties: Properties) {
        self.capture(event_type, properties);
    }

    /// Record a navigation; the previous page becomes the referrer
    pub fn track_page_view(&self, url: &str, mut properties: Properties) {
        let previous = self.factory.page().url;
        self.factory.set_page(Some(url.to_string()), previous);

        properties.insert("url".to_string(), Value::String(url.to_string()));
        self.capture(event_types::PAGE_VIEW, properties);
    }

    /// Record an error with its message
    pub fn track_error(&self, message: &str, mut properties: Properties) {
        properties.insert("message".to_string(), Value::String(message.to_string()));
        self.capture(event_types::ERROR, properties);
    }

    /// Update the page context without emitting an event
    pub fn set_page(&self, url: Option<String>, referrer: Option<String>) {
        self.factory.set_page(url, referrer);
    }

    pub fn page(&self) -> PageContext {
        self.factory.page()
    }

    fn capture(&self, event_type: &str, properties: Properties) {
        let event = self.factory.capture(event_type, properties);
        metrics::counter!("telemetry_events_captured_total").increment(1);
        debug!(id = event.id(), event_type, "Captured event");

        self.durability.record(&event);
        if let Some(channel) = &self.channel {
            channel.stream(&event);
        }
        self.bus.publish(event.clone());
        self.scheduler.enqueue(event);
    }

    /// Deliver whatever is queued now
    pub async fn flush_now(&self) -> FlushOutcome {
        self.scheduler.flush_now().await
    }

    /// Re-enqueue buffered events that are neither delivered nor queued.
    ///
    /// Returns how many were requeued. Does nothing unless delivered events
    /// are pruned from the buffer, since the ring cannot tell them apart.
    pub fn recover_unsent(&self) -> usize {
        if self.scheduler.state() == FlushState::Closed {
            return 0;
        }
        if !self.config.durability.prune_delivered {
            warn!("Skipping recovery: delivered events are not pruned from the buffer");
            return 0;
        }

        let queued: HashSet<String> = self
            .scheduler
            .queue()
            .snapshot()
            .iter()
            .map(|e| e.id().to_string())
            .collect();

        let pending: Vec<Event> = self
            .durability
            .recent(self.durability.capacity())
            .into_iter()
            .filter(|e| !queued.contains(e.id()))
            .collect();

        let count = pending.len();
        for event in pending {
            self.scheduler.enqueue(event);
        }

        if count > 0 {
            info!("Recovered {} unsent events from durability buffer", count);
        }
        count
    }

    /// Open the push channel.
    ///
    /// Fails when no push endpoint is configured or the client is shut down.
    pub fn connect_live(&self) -> Result<()> {
        if self.unload.has_fired() {
            return Err(TelemetryError::Closed);
        }
        match &self.channel {
            Some(channel) => channel.connect(),
            None => Err(TelemetryError::Config(
                "No push endpoint configured".to_string(),
            )),
        }
    }

    /// Register a handler for inbound push messages
    pub fn on_message<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match &self.channel {
            Some(channel) => {
                channel.on_message(handler);
                Ok(())
            }
            None => Err(TelemetryError::Config(
                "No push endpoint configured".to_string(),
            )),
        }
    }

    /// Local stream of every captured event
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn live_state(&self) -> Option<ChannelState> {
        self.channel.as_ref().map(LivePushChannel::state)
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Up to `n` most recently captured events still in the durability buffer
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.durability.recent(n)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            queue: self.scheduler.queue().stats(),
            scheduler: self.scheduler.stats(),
            buffered: self.durability.len(),
            published: self.bus.published_count(),
        }
    }

    /// Tear down: beacon out what is queued, write the durability ring and
    /// drop the push connection.
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self) -> Option<UnloadReport> {
        let report = self.unload.flush()?;
        self.durability.flush();
        if let Some(channel) = &self.channel {
            channel.disconnect();
        }

        if report.events > 0 && !report.handed_off {
            warn!("{} events could not be handed off at shutdown", report.events);
        }
        info!("Telemetry client shut down");
        Some(report)
    }
}
