//! Tiered memory store.
//!
//! Entries live in exactly one of four tiers, ordered by retention:
//!
//! - **Working**: scratch memory for the current task, TTL and capacity bounded
//! - **Episodic**: events of the session, TTL and capacity bounded
//! - **Semantic**: durable facts
//! - **Skill**: durable procedures
//!
//! Storing content that duplicates an entry of the same tier reinforces the
//! existing entry instead of creating a new one. Reads through `retrieve` and
//! `get` count as accesses, which drive promotion during consolidation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_memory::memory::{MemoryLayer, NewMemory, TieredMemoryStore};
//! use rlm_memory::MemoryConfig;
//!
//! let store = TieredMemoryStore::new(MemoryConfig::default())?;
//!
//! let id = store
//!     .store(NewMemory::new("The API uses JWT for auth", MemoryLayer::Episodic).with_importance(0.9))
//!     .await?;
//!
//! let hits = store.retrieve("jwt", 5, None).await;
//! store.promote(&id, MemoryLayer::Semantic).await;
//! ```

mod persist;
mod schema;
mod store;
pub(crate) mod tiers;
mod types;

mod proptest;

pub use persist::SqliteSnapshotStore;
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::TieredMemoryStore;
pub use types::{
    EntryId, MemoryEntry, MemoryLayer, MemorySnapshot, MemoryStats, NewMemory, DAY_MS,
    SNAPSHOT_VERSION,
};
