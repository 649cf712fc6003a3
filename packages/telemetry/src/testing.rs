// packages/telemetry/src/testing.rs
//! Shared fakes for unit tests

use crate::capture::event::{Event, EventMetadata, Properties, SessionIdentity};
use crate::delivery::transport::Transport;
use crate::delivery::unload::UnloadTransport;
use crate::live::connection::{InboundFrame, PushConnection, PushConnector};
use crate::storage::store::{DurableStore, MemoryStore};
use crate::utils::clock::Clock;
use crate::utils::errors::{Result, TelemetryError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

const FIXED_TIME: &str = "2026-10-19T12:00:00Z";

fn fixed_time() -> DateTime<Utc> {
    FIXED_TIME.parse().unwrap()
}

/// Event with a fixed identity and the given id
pub(crate) fn test_event(id: &str) -> Event {
    Event::new(
        id.to_string(),
        "test".to_string(),
        SessionIdentity {
            session_id: "sess_test".to_string(),
            anonymous_id: "anon_test".to_string(),
            user_id: None,
        },
        fixed_time(),
        Properties::new(),
        EventMetadata {
            user_agent: "test-agent".to_string(),
            url: None,
            referrer: None,
            sdk_version: "0.0.0-test".to_string(),
        },
    )
}

/// Clock that only moves when told to
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(fixed_time()),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Store whose every operation fails
pub(crate) struct FailingStore;

impl DurableStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(TelemetryError::Storage("store unavailable".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(TelemetryError::Storage("store unavailable".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(TelemetryError::Storage("store unavailable".to_string()))
    }
}

/// In-memory store with a slow `get` and a write counter
pub(crate) struct SlowStore {
    inner: MemoryStore,
    get_delay: Duration,
    sets: AtomicUsize,
}

impl SlowStore {
    pub(crate) fn new(get_delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            get_delay,
            sets: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

impl DurableStore for SlowStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.get_delay.is_zero() {
            std::thread::sleep(self.get_delay);
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }
}

/// Transport that records every attempt and answers from a script.
///
/// An empty script means success. A gated transport parks each attempt
/// until [`ScriptedTransport::release`] hands out a permit.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<()>>>,
    fail_always: AtomicBool,
    panic_next: AtomicBool,
    batches: Mutex<Vec<Vec<String>>>,
    sent_tx: mpsc::UnboundedSender<Vec<String>>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<String>>>,
    gate: Option<Semaphore>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::build(None)
    }

    pub(crate) fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            fail_always: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            gate,
        }
    }

    pub(crate) fn fail_next(&self, n: usize) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Err(TelemetryError::Transport("scripted failure".to_string())));
        }
    }

    pub(crate) fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    /// Make the next attempt panic after it is recorded
    pub(crate) fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn push_error(&self, error: TelemetryError) {
        self.script.lock().push_back(Err(error));
    }

    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Ids of the next attempted batch
    pub(crate) async fn next_batch(&self) -> Vec<String> {
        self.sent_rx.lock().await.recv().await.unwrap_or_default()
    }

    /// Ids of every attempted batch so far
    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, batch: &[Event]) -> Result<()> {
        let ids: Vec<String> = batch.iter().map(|e| e.id().to_string()).collect();
        self.batches.lock().push(ids.clone());
        let _ = self.sent_tx.send(ids);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted transport panic");
        }
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(TelemetryError::Transport("collector down".to_string()));
        }
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Beacon that records what it was handed
pub(crate) struct RecordingBeacon {
    accept: bool,
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingBeacon {
    pub(crate) fn accepting() -> Self {
        Self {
            accept: true,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            accept: false,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

impl UnloadTransport for RecordingBeacon {
    fn send_beacon(&self, batch: Vec<Event>) -> bool {
        self.batches
            .lock()
            .push(batch.iter().map(|e| e.id().to_string()).collect());
        self.accept
    }
}

/// Request seen by [`CollectorStub`]
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: Bytes,
}

/// Local HTTP collector answering every request the same way
pub(crate) struct CollectorStub {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl CollectorStub {
    pub(crate) async fn start(status: StatusCode, body: &'static str) -> Self {
        Self::start_with_delay(status, body, Duration::ZERO).await
    }

    pub(crate) async fn start_with_delay(status: StatusCode, body: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        async move {
                            let authorization = req
                                .headers()
                                .get(AUTHORIZATION)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let body_bytes = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes())
                                .unwrap_or_default();
                            recorded.lock().push(RecordedRequest {
                                authorization,
                                body: body_bytes,
                            });

                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }

                            let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests, task }
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("http://{}/api/analytics/events", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for CollectorStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum ConnectStep {
    Accept(FakeConnection),
    Fail,
}

/// Connector replaying a script of accepts and failures.
///
/// Connects past the end of the script fail.
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectStep>>,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
        }
    }

    /// Script a successful connect; returns the server end of it
    pub(crate) fn accept_next(&self) -> RemotePeer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        self.script.lock().push_back(ConnectStep::Accept(FakeConnection {
            inbound: inbound_rx,
            outbound: outbound_tx,
        }));

        RemotePeer {
            inbound: Mutex::new(Some(inbound_tx)),
            outbound: tokio::sync::Mutex::new(outbound_rx),
        }
    }

    pub(crate) fn fail_next(&self) {
        self.script.lock().push_back(ConnectStep::Fail);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(ConnectStep::Accept(conn)) => Ok(Box::new(conn)),
            Some(ConnectStep::Fail) | None => {
                Err(TelemetryError::Channel("connection refused".to_string()))
            }
        }
    }
}

struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| TelemetryError::Channel("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame>> {
        self.inbound.recv().await.map(|text| Ok(InboundFrame::Text(text)))
    }
}

/// Server side of a scripted connection
pub(crate) struct RemotePeer {
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl RemotePeer {
    pub(crate) fn push(&self, frame: String) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub(crate) fn close(&self) {
        self.inbound.lock().take();
    }

    pub(crate) async fn next_sent(&self) -> String {
        self.outbound.lock().await.recv().await.unwrap_or_default()
    }
}
