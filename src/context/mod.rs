//! Adaptive context pruning.
//!
//! Given scored candidates and a token budget, the [`ContextPruner`] picks the
//! subset to place in a context window. Three strategies are available:
//!
//! - [`PruneStrategy::Greedy`]: highest weighted score first
//! - [`PruneStrategy::Knapsack`]: exact value-maximizing subset
//! - [`PruneStrategy::Diversity`]: maximal marginal relevance over embeddings
//!
//! ```rust,ignore
//! use rlm_memory::context::{ContextItem, ContextPruner, PruneStrategy};
//!
//! let pruner = ContextPruner::default();
//! let items = vec![
//!     ContextItem::from_text("auth", "The API uses JWT for auth").with_relevance(0.9),
//!     ContextItem::from_text("db", "Postgres pool size is 20").with_relevance(0.4),
//! ];
//!
//! let result = pruner.prune(&items, 4000, PruneStrategy::Knapsack)?;
//! assert!(result.total_tokens <= 4000);
//! ```

mod proptest;
mod pruner;
mod types;

pub use pruner::{ContextPruner, KNAPSACK_SCALE};
pub use types::{approx_tokens, ContextItem, PruneResult, PruneStrategy};
