// packages/telemetry/src/capture/factory.rs
//! Event construction
//!
//! Stamps id, timestamp, identity and client context onto a type name and a
//! property map. Construction does no network I/O and never fails.

use crate::capture::event::{Event, EventMetadata, Properties};
use crate::capture::identity::IdentityResolver;
use crate::utils::clock::Clock;
use crate::utils::config::ClientConfig;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use ulid::{Generator, Ulid};

/// Page context that changes as the user navigates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub url: Option<String>,
    pub referrer: Option<String>,
}

/// Builds immutable [`Event`] records
pub struct EventFactory {
    identity: Arc<IdentityResolver>,
    clock: Arc<dyn Clock>,
    client: ClientConfig,
    page: RwLock<PageContext>,
    ids: Mutex<Generator>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl EventFactory {
    pub fn new(identity: Arc<IdentityResolver>, clock: Arc<dyn Clock>, client: ClientConfig) -> Self {
        Self {
            identity,
            clock,
            client,
            page: RwLock::new(PageContext::default()),
            ids: Mutex::new(Generator::new()),
            last_timestamp: Mutex::new(None),
        }
    }

    /// Build an event of `event_type` carrying `properties`
    pub fn capture(&self, event_type: &str, properties: Properties) -> Event {
        let id = self.next_id();
        let timestamp = self.next_timestamp();
        let identity = self.identity.resolve();

        let page = self.page.read().clone();
        let metadata = EventMetadata {
            user_agent: self.client.user_agent.clone(),
            url: page.url,
            referrer: page.referrer,
            sdk_version: self.client.sdk_version.clone(),
        };

        Event::new(id, event_type.to_string(), identity, timestamp, properties, metadata)
    }

    /// Update the page context stamped into later events
    pub fn set_page(&self, url: Option<String>, referrer: Option<String>) {
        *self.page.write() = PageContext { url, referrer };
    }

    pub fn page(&self) -> PageContext {
        self.page.read().clone()
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    fn next_id(&self) -> String {
        // The generator only fails when the random part overflows within one
        // millisecond; a fresh ULID is still unique there.
        self.ids
            .lock()
            .generate()
            .unwrap_or_else(|_| Ulid::new())
            .to_string()
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self.last_timestamp.lock();
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }
}
