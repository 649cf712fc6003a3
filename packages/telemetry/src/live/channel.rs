// packages/telemetry/src/live/channel.rs
//! Reconnecting push channel
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!        ▲                         │                  │ error / close
//!        │                         └──fail──┐         ▼
//!        │ attempts exhausted               └──▶ Reconnecting{n} ──ok──▶ Connected
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! Backoff doubles per attempt from `base_delay` up to `max_delay`, with up
//! to 10% jitter. After `max_attempts` failed reconnects the channel stays in
//! `Disconnected(RetriesExhausted)` until `connect()` is called again.
//!
//! Inbound frames are decoded as events and handed to every handler
//! registered with [`LivePushChannel::on_message`]; handlers outlive
//! individual connections. Malformed frames are logged and skipped.
//!
//! A connection only resets the reconnect budget once it has proven useful:
//! it delivered an event, accepted an outbound frame, or stayed up for at
//! least `max_delay`. A peer that accepts and then drops or babbles still
//! runs the channel into `RetriesExhausted`.
//!
//! The channel also fronts the local [`EventBus`], which works whether or
//! not a connection is up.

use crate::capture::event::Event;
use crate::live::bus::EventBus;
use crate::live::connection::{InboundFrame, PushConnection, PushConnector};
use crate::utils::config::LiveConfig;
use crate::utils::errors::{Result, TelemetryError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why the channel is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `connect()` has not been called
    NotStarted,

    /// Owner called `disconnect()`
    Requested,

    /// Reconnect budget spent; terminal until `connect()`
    RetriesExhausted,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected(DisconnectReason),
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Reconnect backoff
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub outbound_capacity: usize,
}

impl ReconnectPolicy {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }

    /// Delay before reconnect `attempt` (1-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 10;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&LiveConfig::default())
    }
}

/// Callback for inbound push messages
pub type MessageHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct ChannelInner {
    connector: Arc<dyn PushConnector>,
    bus: Arc<EventBus>,
    policy: ReconnectPolicy,
    handlers: RwLock<Vec<MessageHandler>>,
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Persistent duplex connection to the collector's push endpoint
#[derive(Clone)]
pub struct LivePushChannel {
    inner: Arc<ChannelInner>,
}

impl LivePushChannel {
    pub fn new(connector: Arc<dyn PushConnector>, policy: ReconnectPolicy) -> Self {
        let bus = Arc::new(EventBus::new(LiveConfig::default().bus_capacity));
        Self::with_bus(connector, policy, bus)
    }

    /// Build a channel fronting an existing bus
    pub fn with_bus(
        connector: Arc<dyn PushConnector>,
        policy: ReconnectPolicy,
        bus: Arc<EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected(DisconnectReason::NotStarted));
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                bus,
                policy,
                handlers: RwLock::new(Vec::new()),
                state,
                outbound: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start connecting in the background. No-op while already running.
    pub fn connect(&self) -> Result<()> {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let handle = Handle::try_current()
            .map_err(|_| TelemetryError::Channel("connect() needs a tokio runtime".to_string()))?;

        self.inner.state.send_replace(ChannelState::Connecting);
        let inner = Arc::clone(&self.inner);
        *task = Some(handle.spawn(async move { inner.run().await }));
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.outbound.lock().take();
        self.inner
            .state
            .send_replace(ChannelState::Disconnected(DisconnectReason::Requested));
        info!("Push channel disconnected");
    }

    /// Register a handler for inbound messages; kept across reconnects
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Forward a captured event to the server if connected.
    ///
    /// Returns false when the event was not queued for sending
    /// (disconnected, or the outbound buffer is full).
    pub fn stream(&self, event: &Event) -> bool {
        let outbound = self.inner.outbound.lock();
        let Some(sender) = outbound.as_ref() else {
            return false;
        };

        match serde_json::to_string(event) {
            Ok(frame) => sender.try_send(frame).is_ok(),
            Err(e) => {
                warn!("Failed to encode event {} for push: {}", event.id(), e);
                false
            }
        }
    }

    /// Fan an event out to local subscribers
    pub fn publish(&self, event: Event) -> usize {
        self.inner.bus.publish(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }
}

impl ChannelInner {
    async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;

        loop {
            match self.connector.connect().await {
                Ok(conn) => {
                    if attempt > 0 {
                        info!("Push channel reconnected after {} attempts", attempt);
                    } else {
                        info!("Push channel connected");
                    }

                    let (tx, rx) = mpsc::channel(self.policy.outbound_capacity);
                    *self.outbound.lock() = Some(tx);
                    self.state.send_replace(ChannelState::Connected);

                    let opened = Instant::now();
                    let useful = self.pump(conn, rx).await;
                    self.outbound.lock().take();

                    if useful || opened.elapsed() >= self.policy.max_delay {
                        attempt = 0;
                    } else {
                        debug!(attempt, "Push connection dropped before carrying traffic");
                    }
                }
                Err(e) => {
                    warn!(attempt, "Push channel connect failed: {}", e);
                }
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    "Push channel giving up after {} reconnect attempts",
                    self.policy.max_attempts
                );
                self.state
                    .send_replace(ChannelState::Disconnected(DisconnectReason::RetriesExhausted));
                return;
            }

            attempt += 1;
            self.state.send_replace(ChannelState::Reconnecting { attempt });
            metrics::counter!("telemetry_push_reconnects_total").increment(1);

            let delay = self.policy.jittered(attempt);
            debug!(attempt, "Reconnecting push channel in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Shuttle frames until the connection fails or closes.
    ///
    /// Returns true if the connection carried any valid traffic.
    async fn pump(&self, mut conn: Box<dyn PushConnection>, mut outbound: mpsc::Receiver<String>) -> bool {
        let mut useful = false;
        loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(Ok(InboundFrame::Text(text))) => useful |= self.dispatch(&text),
                    Some(Ok(InboundFrame::Malformed(reason))) => {
                        metrics::counter!("telemetry_push_malformed_total").increment(1);
                        warn!("Dropping malformed push frame: {}", reason);
                    }
                    Some(Err(e)) => {
                        warn!("Push channel read failed: {}", e);
                        return useful;
                    }
                    None => {
                        info!("Push channel closed by peer");
                        return useful;
                    }
                },
                Some(frame) = outbound.recv() => {
                    if let Err(e) = conn.send(frame).await {
                        warn!("Push channel write failed: {}", e);
                        return useful;
                    }
                    useful = true;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) -> bool {
        let event: Event = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("telemetry_push_malformed_total").increment(1);
                warn!("Dropping malformed push message: {}", e);
                return false;
            }
        };

        let handlers: Vec<MessageHandler> = self.handlers.read().clone();
        for handler in handlers {
            handler(&event);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::connection::TcpConnector;
    use crate::testing::{test_event, ScriptedConnector};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            outbound_capacity: 16,
        }
    }

    fn frame(id: &str) -> String {
        serde_json::to_string(&test_event(id)).unwrap()
    }

    async fn wait_for(channel: &LivePushChannel, expected: ChannelState) {
        let mut rx = channel.watch_state();
        rx.wait_for(|s| *s == expected).await.unwrap();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(12), Duration::from_secs(5));

        let jittered = policy.jittered(2);
        assert!(jittered >= Duration::from_millis(200));
        assert!(jittered <= Duration::from_millis(220));
    }

    #[test]
    fn test_connect_requires_runtime() {
        let channel = LivePushChannel::new(Arc::new(ScriptedConnector::new()), policy(1));
        assert!(matches!(channel.connect(), Err(TelemetryError::Channel(_))));
        assert_eq!(
            channel.state(),
            ChannelState::Disconnected(DisconnectReason::NotStarted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_survive_reconnect() {
        let connector = Arc::new(ScriptedConnector::new());
        let first = connector.accept_next();
        connector.fail_next();
        let second = connector.accept_next();

        let channel = LivePushChannel::new(connector.clone(), policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |event| {
            let _ = tx.send(event.id().to_string());
        });

        channel.connect().unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        first.push(frame("evt_before"));
        assert_eq!(rx.recv().await.unwrap(), "evt_before");

        first.close();
        wait_for(&channel, ChannelState::Reconnecting { attempt: 2 }).await;
        wait_for(&channel, ChannelState::Connected).await;
        assert_eq!(connector.attempts(), 3);

        second.push(frame("evt_after"));
        assert_eq!(rx.recv().await.unwrap(), "evt_after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::new());
        let channel = LivePushChannel::new(connector.clone(), policy(3));

        channel.connect().unwrap();
        wait_for(
            &channel,
            ChannelState::Disconnected(DisconnectReason::RetriesExhausted),
        )
        .await;

        // Initial connect plus three reconnects.
        assert_eq!(connector.attempts(), 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 4);

        let conn = connector.accept_next();
        channel.connect().unwrap();
        wait_for(&channel, ChannelState::Connected).await;
        assert_eq!(connector.attempts(), 5);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_connection() {
        let connector = Arc::new(ScriptedConnector::new());
        let remote = connector.accept_next();

        let channel = LivePushChannel::new(connector.clone(), policy(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |event| {
            let _ = tx.send(event.id().to_string());
        });
        channel.connect().unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        remote.push("{ definitely not an event".to_string());
        remote.push(frame("evt_ok"));

        assert_eq!(rx.recv().await.unwrap(), "evt_ok");
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_tcp_frames_keep_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counted = accepts.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            stream.write_all(b"\xc3\x28 not utf8\n").await.unwrap();
            stream.write_all(&vec![b'{'; 70 * 1024]).await.unwrap();
            stream.write_all(b"\n").await.unwrap();
            stream.write_all(format!("{}\n", frame("evt_ok")).as_bytes()).await.unwrap();
            // Hold the socket open; a second accept would mean a reconnect.
            let _ = listener.accept().await;
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let connector = Arc::new(TcpConnector::new(addr.to_string(), Duration::from_secs(2)));
        let channel = LivePushChannel::new(connector, policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |event| {
            let _ = tx.send(event.id().to_string());
        });
        channel.connect().unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received.unwrap(), "evt_ok");
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);

        channel.disconnect();
        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_useless_connections_spend_retry_budget() {
        let connector = Arc::new(ScriptedConnector::new());
        let peers: Vec<_> = (0..5).map(|_| connector.accept_next()).collect();
        for peer in &peers {
            peer.push("not json".to_string());
            peer.close();
        }

        let channel = LivePushChannel::new(connector.clone(), policy(2));
        channel.connect().unwrap();
        wait_for(
            &channel,
            ChannelState::Disconnected(DisconnectReason::RetriesExhausted),
        )
        .await;

        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_forwards_only_when_connected() {
        let connector = Arc::new(ScriptedConnector::new());
        let remote = connector.accept_next();
        let channel = LivePushChannel::new(connector, policy(1));

        assert!(!channel.stream(&test_event("evt_early")));

        channel.connect().unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        assert!(channel.stream(&test_event("evt_1")));
        let sent = remote.next_sent().await;
        let event: Event = serde_json::from_str(&sent).unwrap();
        assert_eq!(event.id(), "evt_1");
    }

    #[tokio::test]
    async fn test_local_bus_works_while_disconnected() {
        let channel = LivePushChannel::new(Arc::new(ScriptedConnector::new()), policy(1));
        let mut rx = channel.subscribe();

        assert_eq!(channel.publish(test_event("evt_1")), 1);
        assert_eq!(rx.recv().await.unwrap().id(), "evt_1");
        assert_eq!(channel.bus().published_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_explicit_and_final() {
        let connector = Arc::new(ScriptedConnector::new());
        let _remote = connector.accept_next();
        let channel = LivePushChannel::new(connector.clone(), policy(3));

        channel.connect().unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        channel.disconnect();
        assert_eq!(
            channel.state(),
            ChannelState::Disconnected(DisconnectReason::Requested)
        );
        assert!(!channel.stream(&test_event("evt_1")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }
}
