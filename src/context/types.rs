//! Pruning types: ContextItem, PruneStrategy, PruneResult.

use crate::memory::MemoryEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approximate token count of a text (about four characters per token).
pub fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

/// A candidate for inclusion in a bounded context window.
///
/// Scores are expected in `[0, 1]`; the builders clamp them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Caller-defined identifier
    pub id: String,
    /// Text that would be placed in the context
    pub content: String,
    /// Cost of including the item
    pub token_count: usize,
    /// How well the item answers the current query
    pub relevance: f64,
    /// How fresh the item is
    pub recency: f64,
    /// How much the item matters regardless of the query
    pub importance: f64,
    /// Optional embedding for diversity and coverage
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
}

impl ContextItem {
    /// Create an item with all scores at zero.
    pub fn new(id: impl Into<String>, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            token_count,
            relevance: 0.0,
            recency: 0.0,
            importance: 0.0,
            embedding: None,
        }
    }

    /// Create an item whose token count is estimated from its text.
    pub fn from_text(id: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = approx_tokens(&content);
        Self::new(id, content, tokens)
    }

    /// Project a stored memory into a candidate.
    ///
    /// Importance and embedding come from the entry, recency from its last
    /// access; relevance is supplied by the caller's query.
    pub fn from_memory(entry: &MemoryEntry, relevance: f64, now: DateTime<Utc>) -> Self {
        let mut item = Self::from_text(entry.id.to_string(), entry.content.clone())
            .with_relevance(relevance)
            .with_recency(entry.recency(now))
            .with_importance(entry.importance);
        item.embedding = entry.embedding.clone();
        item
    }

    /// Set the relevance score.
    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = clamp_score(relevance);
        self
    }

    /// Set the recency score.
    pub fn with_recency(mut self, recency: f64) -> Self {
        self.recency = clamp_score(recency);
        self
    }

    /// Set the importance score.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = clamp_score(importance);
        self
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// How the pruner chooses items under a token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStrategy {
    /// Highest score first, skipping items that no longer fit
    #[default]
    Greedy,
    /// Exact 0/1 knapsack over integer-scaled scores
    Knapsack,
    /// Maximal marginal relevance: relevance traded against redundancy
    Diversity,
}

impl PruneStrategy {
    /// Convert to string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::Knapsack => "knapsack",
            Self::Diversity => "diversity",
        }
    }
}

impl std::fmt::Display for PruneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PruneStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(Self::Greedy),
            "knapsack" => Ok(Self::Knapsack),
            "diversity" | "mmr" => Ok(Self::Diversity),
            other => Err(format!("unknown prune strategy: {}", other)),
        }
    }
}

/// Outcome of one prune call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneResult {
    /// Selected items, in selection order
    pub items: Vec<ContextItem>,
    /// Sum of the selected items' token counts; never above the budget
    pub total_tokens: usize,
    /// Number of selected items
    pub items_included: usize,
    /// Number of input items not selected, including those below the
    /// relevance floor
    pub items_excluded: usize,
    /// Fraction of eligible items represented by the selection, in `[0, 1]`
    pub coverage: f64,
    /// Strategy that actually ran (knapsack may fall back to greedy)
    pub strategy: PruneStrategy,
}

impl PruneResult {
    pub(crate) fn empty(input_len: usize, strategy: PruneStrategy) -> Self {
        Self {
            items: Vec::new(),
            total_tokens: 0,
            items_included: 0,
            items_excluded: input_len,
            coverage: 0.0,
            strategy,
        }
    }

    /// Ids of the selected items.
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }
}
