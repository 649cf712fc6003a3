// packages/telemetry/src/capture/mod.rs
//! Event capture
//!
//! - **Event**: Immutable telemetry record and its wire shape
//! - **Identity**: Session, anonymous and user id resolution
//! - **Factory**: Stamps id, timestamp, identity and client context

pub mod event;
pub mod factory;
pub mod identity;

pub use event::{event_types, Event, EventMetadata, Properties, SessionIdentity};
pub use factory::{EventFactory, PageContext};
pub use identity::{AuthState, IdentityResolver, StaticAuth};
