//! # rlm-memory
//!
//! Tiered memory and context budgeting for long-running assistant sessions.
//!
//! ## Core Components
//!
//! - **Memory**: four-tier store (working, episodic, semantic, skill) with
//!   deduplication, keyword and embedding retrieval, and snapshots
//! - **Consolidation**: periodic eviction, promotion and merging of entries
//! - **Context**: token-budgeted selection of candidates (greedy, knapsack, MMR)
//! - **Events**: broadcast notifications for every tier change
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rlm_memory::{
//!     ConsolidationEngine, ContextItem, ContextPruner, MemoryConfig, MemoryLayer, NewMemory,
//!     PruneStrategy, TieredMemoryStore,
//! };
//!
//! let store = Arc::new(TieredMemoryStore::new(MemoryConfig::default())?);
//! store.store(NewMemory::new("Use Redis for caching", MemoryLayer::Episodic)).await?;
//!
//! let engine = Arc::new(ConsolidationEngine::new(Arc::clone(&store)));
//! let handle = Arc::clone(&engine).spawn();
//!
//! let now = store.clock().now();
//! let candidates: Vec<ContextItem> = store
//!     .retrieve("redis", 20, None)
//!     .await
//!     .iter()
//!     .map(|entry| ContextItem::from_memory(entry, 0.8, now))
//!     .collect();
//!
//! let pruned = ContextPruner::default().prune(&candidates, 2000, PruneStrategy::Diversity)?;
//! handle.stop().await?;
//! ```

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod embedding;
pub mod error;
pub mod events;
pub mod memory;
pub mod similarity;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MemoryConfig, PrunerConfig};
pub use consolidation::{
    ConsolidationEngine, ConsolidationHandle, ConsolidationPhase, ConsolidationResult,
};
pub use context::{ContextItem, ContextPruner, PruneResult, PruneStrategy};
pub use embedding::{Embedder, HashingEmbedder};
pub use error::{Error, Result};
pub use events::{EventBus, EvictionReason, MemoryEvent};
pub use memory::{
    EntryId, MemoryEntry, MemoryLayer, MemorySnapshot, MemoryStats, NewMemory,
    SqliteSnapshotStore, TieredMemoryStore,
};
