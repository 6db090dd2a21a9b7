//! Budget-bounded context selection.

use super::types::{ContextItem, PruneResult, PruneStrategy};
use crate::config::PrunerConfig;
use crate::error::Result;
use crate::similarity::{common_dimension, cosine_similarity};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Scores are multiplied by this before the knapsack rounds them to integers.
pub const KNAPSACK_SCALE: f64 = 1000.0;

/// Diversity credited to an item that has no embedding.
const UNEMBEDDED_DIVERSITY: f64 = 0.5;

/// Selects the subset of candidates that fits a token budget.
///
/// Holds only configuration; every call is independent of the last.
#[derive(Debug, Clone, Default)]
pub struct ContextPruner {
    config: PrunerConfig,
}

impl ContextPruner {
    /// Create a pruner.
    pub fn new(config: PrunerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Pruner configuration.
    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Weighted score of an item.
    pub fn score(&self, item: &ContextItem) -> f64 {
        self.config.relevance_weight * item.relevance
            + self.config.recency_weight * item.recency
            + self.config.importance_weight * item.importance
    }

    /// Integer value the knapsack maximizes for an item.
    pub fn knapsack_value(&self, item: &ContextItem) -> u64 {
        (self.score(item) * KNAPSACK_SCALE).round().max(0.0) as u64
    }

    /// Select items totalling at most `max_tokens`.
    ///
    /// Items below `min_relevance` are dropped first. A budget smaller than
    /// every item yields an empty selection, not an error. Embeddings of
    /// different lengths among the eligible items are an error.
    pub fn prune(
        &self,
        items: &[ContextItem],
        max_tokens: usize,
        strategy: PruneStrategy,
    ) -> Result<PruneResult> {
        let eligible: Vec<&ContextItem> = items
            .iter()
            .filter(|item| item.relevance >= self.config.min_relevance)
            .collect();

        if eligible.is_empty() {
            debug!(input = items.len(), "no items above relevance floor");
            return Ok(PruneResult::empty(items.len(), strategy));
        }

        common_dimension(eligible.iter().filter_map(|item| item.embedding.as_deref()))?;

        let (selected, used) = match strategy {
            PruneStrategy::Greedy => (self.select_greedy(&eligible, max_tokens), strategy),
            PruneStrategy::Knapsack => match self.select_knapsack(&eligible, max_tokens) {
                Some(selected) => (selected, strategy),
                None => (
                    self.select_greedy(&eligible, max_tokens),
                    PruneStrategy::Greedy,
                ),
            },
            PruneStrategy::Diversity => (self.select_mmr(&eligible, max_tokens)?, strategy),
        };

        let coverage = self.coverage(&eligible, &selected)?;
        let chosen: Vec<ContextItem> = selected.iter().map(|&i| eligible[i].clone()).collect();
        let total_tokens: usize = chosen.iter().map(|item| item.token_count).sum();

        debug!(
            strategy = %used,
            eligible = eligible.len(),
            included = chosen.len(),
            total_tokens,
            max_tokens,
            coverage,
            "pruned context"
        );

        Ok(PruneResult {
            items_included: chosen.len(),
            items_excluded: items.len() - chosen.len(),
            items: chosen,
            total_tokens,
            coverage,
            strategy: used,
        })
    }

    /// Indices of `eligible` ordered by score, highest first; ties keep input order.
    fn by_score(&self, eligible: &[&ContextItem]) -> Vec<usize> {
        let scores: Vec<f64> = eligible.iter().map(|item| self.score(item)).collect();
        let mut order: Vec<usize> = (0..eligible.len()).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
        order
    }

    fn select_greedy(&self, eligible: &[&ContextItem], max_tokens: usize) -> Vec<usize> {
        let mut used = 0usize;
        let mut selected = Vec::new();
        for i in self.by_score(eligible) {
            let tokens = eligible[i].token_count;
            if tokens <= max_tokens - used {
                used += tokens;
                selected.push(i);
            }
        }
        selected
    }

    /// Exact 0/1 knapsack over integer-scaled scores. Returns `None` when the
    /// table would exceed `max_knapsack_cells`.
    ///
    /// Rounding can make the integer optimum score lower than the greedy pack
    /// on real scores; the greedy pack is returned in that case.
    fn select_knapsack(&self, eligible: &[&ContextItem], max_tokens: usize) -> Option<Vec<usize>> {
        let total: usize = eligible.iter().map(|item| item.token_count).sum();
        let capacity = max_tokens.min(total);
        let width = capacity + 1;

        let cells = eligible.len().saturating_mul(width);
        if cells > self.config.max_knapsack_cells {
            warn!(
                items = eligible.len(),
                capacity,
                cells,
                limit = self.config.max_knapsack_cells,
                "knapsack table too large, falling back to greedy"
            );
            return None;
        }

        let values: Vec<u64> = eligible.iter().map(|item| self.knapsack_value(item)).collect();
        let mut best = vec![0u64; width];
        let mut keep = vec![false; cells];

        for (i, item) in eligible.iter().enumerate() {
            let weight = item.token_count;
            if weight > capacity {
                continue;
            }
            for w in (weight..=capacity).rev() {
                let candidate = best[w - weight] + values[i];
                if candidate > best[w] {
                    best[w] = candidate;
                    keep[i * width + w] = true;
                }
            }
        }

        let mut selected = Vec::new();
        let mut w = capacity;
        for i in (0..eligible.len()).rev() {
            if keep[i * width + w] {
                selected.push(i);
                w -= eligible[i].token_count;
            }
        }

        // Present in score order like the other strategies.
        let rank: Vec<usize> = {
            let order = self.by_score(eligible);
            let mut rank = vec![0; eligible.len()];
            for (pos, i) in order.into_iter().enumerate() {
                rank[i] = pos;
            }
            rank
        };
        selected.sort_by_key(|&i| rank[i]);

        let greedy = self.select_greedy(eligible, max_tokens);
        if self.total_score(eligible, &greedy) > self.total_score(eligible, &selected) {
            debug!("greedy pack outscores rounded knapsack optimum");
            return Some(greedy);
        }
        Some(selected)
    }

    fn total_score(&self, eligible: &[&ContextItem], selected: &[usize]) -> f64 {
        selected.iter().map(|&i| self.score(eligible[i])).sum()
    }

    /// Maximal marginal relevance selection.
    fn select_mmr(&self, eligible: &[&ContextItem], max_tokens: usize) -> Result<Vec<usize>> {
        let lambda = self.config.diversity_lambda;
        let mut remaining: Vec<usize> = (0..eligible.len()).collect();
        let mut selected: Vec<usize> = Vec::new();
        let mut used = 0usize;

        loop {
            let budget = max_tokens - used;
            let mut best: Option<(usize, f64)> = None;

            for (pos, &i) in remaining.iter().enumerate() {
                let item = eligible[i];
                if item.token_count > budget {
                    continue;
                }
                let diversity = match item.embedding.as_deref() {
                    None => UNEMBEDDED_DIVERSITY,
                    Some(embedding) => {
                        let mut max_sim: Option<f64> = None;
                        for &s in &selected {
                            if let Some(other) = eligible[s].embedding.as_deref() {
                                let sim = cosine_similarity(embedding, other)?;
                                max_sim = Some(max_sim.map_or(sim, |m| m.max(sim)));
                            }
                        }
                        1.0 - max_sim.unwrap_or(0.0)
                    }
                };
                let mmr = lambda * item.relevance + (1.0 - lambda) * diversity;
                if best.map_or(true, |(_, score)| mmr > score) {
                    best = Some((pos, mmr));
                }
            }

            let Some((pos, _)) = best else {
                break;
            };
            let i = remaining.remove(pos);
            used += eligible[i].token_count;
            selected.push(i);
        }

        Ok(selected)
    }

    /// Fraction of eligible items the selection represents.
    ///
    /// With embeddings, an eligible item is covered when it is selected or
    /// is within `coverage_threshold` cosine of a selected item. Without any
    /// embeddings this is simply selected / eligible.
    fn coverage(&self, eligible: &[&ContextItem], selected: &[usize]) -> Result<f64> {
        if eligible.is_empty() {
            return Ok(0.0);
        }
        if !eligible.iter().any(|item| item.embedding.is_some()) {
            return Ok(selected.len() as f64 / eligible.len() as f64);
        }

        let mut is_selected = vec![false; eligible.len()];
        for &i in selected {
            is_selected[i] = true;
        }
        let selected_embeddings: Vec<&[f32]> = selected
            .iter()
            .filter_map(|&i| eligible[i].embedding.as_deref())
            .collect();

        let mut covered = 0usize;
        for (i, item) in eligible.iter().enumerate() {
            if is_selected[i] {
                covered += 1;
                continue;
            }
            let Some(embedding) = item.embedding.as_deref() else {
                continue;
            };
            for other in &selected_embeddings {
                if cosine_similarity(embedding, other)? >= self.config.coverage_threshold {
                    covered += 1;
                    break;
                }
            }
        }

        Ok(covered as f64 / eligible.len() as f64)
    }
}
