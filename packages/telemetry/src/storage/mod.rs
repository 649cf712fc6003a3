// packages/telemetry/src/storage/mod.rs
//! Local persistence
//!
//! - **Store**: Key/value surfaces (in-memory and SQLite)
//! - **Durability**: Bounded ring of recent events for crash/offline recovery

pub mod durability;
pub mod store;

pub use durability::DurabilityBuffer;
pub use store::{DurableStore, MemoryStore, SqliteStore};
