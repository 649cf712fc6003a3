// packages/telemetry/src/capture/event.rs
//! Telemetry event record
//!
//! Events are constructed once by the [`EventFactory`](super::EventFactory)
//! and never mutated afterwards; fields are only reachable through accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form event payload
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Well-known event types. The type field stays an open string.
pub mod event_types {
    pub const PAGE_VIEW: &str = "page_view";
    pub const USER_ACTION: &str = "user_action";
    pub const ERROR: &str = "error";
}

/// A captured telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: String,

    #[serde(rename = "type")]
    event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,

    session_id: String,

    anonymous_id: String,

    timestamp: DateTime<Utc>,

    #[serde(default)]
    properties: Properties,

    metadata: EventMetadata,
}

/// Client context attached at capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub user_agent: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,

    pub sdk_version: String,
}

/// Identity fields stamped into every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub anonymous_id: String,
    pub user_id: Option<String>,
}

impl Event {
    pub(crate) fn new(
        id: String,
        event_type: String,
        identity: SessionIdentity,
        timestamp: DateTime<Utc>,
        properties: Properties,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id,
            event_type,
            user_id: identity.user_id,
            session_id: identity.session_id,
            anonymous_id: identity.anonymous_id,
            timestamp,
            properties,
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn anonymous_id(&self) -> &str {
        &self.anonymous_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
