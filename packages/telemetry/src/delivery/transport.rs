// packages/telemetry/src/delivery/transport.rs
//! Collector delivery over HTTP
//!
//! A batch is POSTed as a JSON array of events. Any 2xx response is success;
//! the response body is drained and ignored so collectors may return
//! whatever extra fields they like. Non-2xx statuses, connection errors and
//! attempts exceeding the per-request deadline are failures.
//!
//! No dedup key is sent, so a batch redelivered after a false-negative
//! failure can be recorded twice by the collector.

use crate::capture::event::Event;
use crate::capture::identity::AuthState;
use crate::utils::errors::{Result, TelemetryError};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub(crate) type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Request/response channel to the collector
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one batch; `Ok` means the collector acknowledged it
    async fn send(&self, batch: &[Event]) -> Result<()>;
}

/// Transport posting batches to the collector endpoint
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: Uri,
    auth: Arc<dyn AuthState>,
    timeout: Duration,
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(endpoint: &str, auth: Arc<dyn AuthState>, timeout: Duration) -> Result<Self> {
        let endpoint: Uri = endpoint
            .parse()
            .map_err(|e| TelemetryError::Config(format!("Invalid collector endpoint: {}", e)))?;

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        Ok(Self {
            endpoint,
            auth,
            timeout,
            client,
        })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub(crate) fn client(&self) -> HttpClient {
        self.client.clone()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Serialize `batch` into a collector request
    pub(crate) fn build_request(&self, batch: &[Event]) -> Result<Request<Full<Bytes>>> {
        let body = serde_json::to_vec(batch)?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json");

        if let Some(token) = self.auth.bearer_token() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TelemetryError::Transport(format!("Request build error: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[Event]) -> Result<()> {
        let request = self.build_request(batch)?;
        let client = self.client.clone();

        let exchange = async move {
            let response = client.request(request).await.map_err(|e| {
                TelemetryError::Transport(format!("Collector request failed: {}", e))
            })?;

            let status = response.status();
            // Drain so the connection can be reused; content is not inspected.
            let _ = response.into_body().collect().await;

            if status.is_success() {
                Ok(())
            } else {
                Err(TelemetryError::Transport(format!("Collector returned {}", status)))
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TelemetryError::Timeout(self.timeout.as_millis() as u64))??;

        debug!("Delivered batch of {} events to {}", batch.len(), self.endpoint);
        Ok(())
    }
}
