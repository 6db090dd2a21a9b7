//! Memory consolidation.
//!
//! A cycle runs four phases in order against a [`TieredMemoryStore`]:
//!
//! 1. **Evict**: drop working/episodic entries older than their TTL
//! 2. **Promote**: move entries with enough accesses one tier forward
//! 3. **Merge**: fold near-duplicate semantic/skill entries together
//! 4. **Capacity**: re-apply working/episodic capacity limits
//!
//! Cycles run on demand via [`ConsolidationEngine::consolidate`] or on a timer
//! via [`ConsolidationEngine::spawn`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rlm_memory::{ConsolidationEngine, MemoryConfig, TieredMemoryStore};
//!
//! let store = Arc::new(TieredMemoryStore::new(MemoryConfig::default())?);
//! let engine = Arc::new(ConsolidationEngine::new(Arc::clone(&store)));
//!
//! let result = engine.consolidate().await;
//! println!("promoted {}, evicted {}", result.promoted, result.evicted);
//!
//! let handle = Arc::clone(&engine).spawn();
//! // ...
//! handle.stop().await?;
//! ```
//!
//! [`TieredMemoryStore`]: crate::memory::TieredMemoryStore

mod engine;
mod scheduler;

pub use engine::{ConsolidationEngine, ConsolidationPhase, ConsolidationResult};
pub use scheduler::ConsolidationHandle;
