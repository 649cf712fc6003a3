// packages/telemetry/src/capture/identity.rs
//! Session, anonymous and user identity resolution
//!
//! - Session id lives in the session-scoped store and is regenerated once
//!   that scope is cleared.
//! - Anonymous id lives in the durable store and is cached after the first
//!   lookup so the capture path stays free of storage I/O.
//! - User id is looked up on the [`AuthState`] on every call.
//!
//! Storage failures never reach the caller: the resolver logs them and
//! sticks to an in-memory id for the rest of the process.

use crate::capture::event::SessionIdentity;
use crate::storage::store::DurableStore;
use crate::utils::errors::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};
use ulid::Ulid;

pub const SESSION_ID_KEY: &str = "lingua.telemetry.session_id";
pub const ANONYMOUS_ID_KEY: &str = "lingua.telemetry.anonymous_id";

/// External holder of the authenticated identity
pub trait AuthState: Send + Sync {
    /// Current user, if signed in
    fn user_id(&self) -> Option<String>;

    /// Credential for outbound collector requests
    fn bearer_token(&self) -> Option<String>;
}

/// Auth state set explicitly by the host application
#[derive(Debug, Default)]
pub struct StaticAuth {
    user_id: RwLock<Option<String>>,
    token: RwLock<Option<String>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>, token: Option<String>) {
        *self.user_id.write() = Some(user_id.into());
        *self.token.write() = token;
    }

    pub fn sign_out(&self) {
        *self.user_id.write() = None;
        *self.token.write() = None;
    }
}

impl AuthState for StaticAuth {
    fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Resolves the identity fields stamped into events
pub struct IdentityResolver {
    session: IdSlot,
    anonymous: IdSlot,
    auth: Arc<dyn AuthState>,
}

impl IdentityResolver {
    pub fn new(
        session_store: Arc<dyn DurableStore>,
        durable_store: Arc<dyn DurableStore>,
        auth: Arc<dyn AuthState>,
    ) -> Self {
        Self {
            // Read through every time so a cleared session scope is noticed.
            session: IdSlot::new(session_store, SESSION_ID_KEY, false),
            anonymous: IdSlot::new(durable_store, ANONYMOUS_ID_KEY, true),
            auth,
        }
    }

    /// Session id for the current session scope
    pub fn resolve_session_id(&self) -> String {
        self.session.resolve()
    }

    /// Device/installation id, stable until the durable store is cleared
    pub fn resolve_anonymous_id(&self) -> String {
        self.anonymous.resolve()
    }

    /// Authenticated user, if any. Not cached.
    pub fn resolve_user_id(&self) -> Option<String> {
        self.auth.user_id()
    }

    pub fn resolve(&self) -> SessionIdentity {
        SessionIdentity {
            session_id: self.resolve_session_id(),
            anonymous_id: self.resolve_anonymous_id(),
            user_id: self.resolve_user_id(),
        }
    }

    /// End the current session scope; the next lookup starts a new one
    pub fn reset_session(&self) {
        self.session.reset();
    }

    /// Forget the anonymous id, locally and in the durable store
    pub fn clear_anonymous_id(&self) {
        self.anonymous.reset();
    }
}

#[derive(Default)]
struct SlotState {
    cached: Option<String>,
    fallback: Option<String>,
}

/// One stored id. The slot lock is held across get, generate and set so
/// concurrent first lookups agree on a single id.
struct IdSlot {
    store: Arc<dyn DurableStore>,
    key: &'static str,
    cache: bool,
    state: Mutex<SlotState>,
}

impl IdSlot {
    fn new(store: Arc<dyn DurableStore>, key: &'static str, cache: bool) -> Self {
        Self {
            store,
            key,
            cache,
            state: Mutex::new(SlotState::default()),
        }
    }

    fn resolve(&self) -> String {
        let mut state = self.state.lock();
        if let Some(id) = state.cached.as_ref().or(state.fallback.as_ref()) {
            return id.clone();
        }

        match read_or_create(self.store.as_ref(), self.key) {
            Ok(id) => {
                if self.cache {
                    state.cached = Some(id.clone());
                }
                id
            }
            Err(e) => {
                // Sticky for the rest of the process.
                warn!(key = self.key, "Store unavailable, using in-memory id: {}", e);
                state.fallback.get_or_insert_with(generate_id).clone()
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        *state = SlotState::default();
        if let Err(e) = self.store.remove(self.key) {
            warn!(key = self.key, "Failed to clear id: {}", e);
        }
    }
}

fn read_or_create(store: &dyn DurableStore, key: &str) -> Result<String> {
    if let Some(id) = store.get(key)?.filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    let id = generate_id();
    store.set(key, &id)?;
    debug!("Generated new {}", key);
    Ok(id)
}

fn generate_id() -> String {
    Ulid::new().to_string()
}
