//! Configuration for the memory store, consolidation engine and pruner.
//!
//! Every option has a default and can be overridden at construction time.
//! Call `validate()` before handing a config to a component; constructors do
//! this for you.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store and consolidation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard capacity of the working tier (default: 100)
    pub max_working_memory: usize,

    /// Hard capacity of the episodic tier (default: 1000)
    pub max_episodic_memory: usize,

    /// Absolute age after which working entries expire (default: 1 hour)
    pub working_ttl: Duration,

    /// Absolute age after which episodic entries expire (default: 24 hours)
    pub episodic_ttl: Duration,

    /// Access count required for automatic promotion (default: 3)
    pub promotion_threshold: u64,

    /// Dedup/merge trigger in (0, 1] (default: 0.95)
    pub similarity_threshold: f64,

    /// Time between automatic consolidation cycles (default: 5 minutes)
    pub consolidation_interval: Duration,

    /// Abandon a cycle that runs longer than this (default: none)
    pub cycle_timeout: Option<Duration>,

    /// Importance given to entries stored without one (default: 0.5)
    pub default_importance: f64,

    /// Buffered events per subscriber before old ones are dropped (default: 256)
    pub event_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_working_memory: 100,
            max_episodic_memory: 1000,
            working_ttl: Duration::from_secs(60 * 60),
            episodic_ttl: Duration::from_secs(24 * 60 * 60),
            promotion_threshold: 3,
            similarity_threshold: 0.95,
            consolidation_interval: Duration::from_secs(5 * 60),
            cycle_timeout: None,
            default_importance: 0.5,
            event_capacity: 256,
        }
    }
}

impl MemoryConfig {
    /// Set tier capacities.
    pub fn with_capacities(mut self, working: usize, episodic: usize) -> Self {
        self.max_working_memory = working;
        self.max_episodic_memory = episodic;
        self
    }

    /// Set tier TTLs.
    pub fn with_ttls(mut self, working: Duration, episodic: Duration) -> Self {
        self.working_ttl = working;
        self.episodic_ttl = episodic;
        self
    }

    /// Set the promotion threshold.
    pub fn with_promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    /// Set the dedup/merge similarity threshold.
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Set the consolidation interval.
    pub fn with_consolidation_interval(mut self, interval: Duration) -> Self {
        self.consolidation_interval = interval;
        self
    }

    /// Set a per-cycle timeout.
    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = Some(timeout);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_working_memory == 0 {
            return Err(invalid("max_working_memory", "must be greater than 0"));
        }
        if self.max_episodic_memory == 0 {
            return Err(invalid("max_episodic_memory", "must be greater than 0"));
        }
        if self.working_ttl.is_zero() {
            return Err(invalid("working_ttl", "must be greater than 0"));
        }
        if self.episodic_ttl.is_zero() {
            return Err(invalid("episodic_ttl", "must be greater than 0"));
        }
        if self.promotion_threshold == 0 {
            return Err(invalid("promotion_threshold", "must be greater than 0"));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(invalid("similarity_threshold", "must be in (0, 1]"));
        }
        if self.consolidation_interval.is_zero() {
            return Err(invalid("consolidation_interval", "must be greater than 0"));
        }
        if matches!(self.cycle_timeout, Some(t) if t.is_zero()) {
            return Err(invalid("cycle_timeout", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.default_importance) {
            return Err(invalid("default_importance", "must be between 0 and 1"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Context pruner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunerConfig {
    /// Weight of the relevance score (default: 0.5)
    pub relevance_weight: f64,

    /// Weight of the recency score (default: 0.2)
    pub recency_weight: f64,

    /// Weight of the importance score (default: 0.3)
    pub importance_weight: f64,

    /// MMR trade-off; 1.0 is pure relevance, 0.0 pure diversity (default: 0.3)
    pub diversity_lambda: f64,

    /// Items below this relevance are dropped before selection (default: 0.1)
    pub min_relevance: f64,

    /// Cosine similarity at which a selected item covers another (default: 0.8)
    pub coverage_threshold: f64,

    /// Largest knapsack table (items x capacity) before falling back to
    /// greedy (default: 50,000,000)
    pub max_knapsack_cells: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.5,
            recency_weight: 0.2,
            importance_weight: 0.3,
            diversity_lambda: 0.3,
            min_relevance: 0.1,
            coverage_threshold: 0.8,
            max_knapsack_cells: 50_000_000,
        }
    }
}

impl PrunerConfig {
    /// Set the three scoring weights.
    pub fn with_weights(mut self, relevance: f64, recency: f64, importance: f64) -> Self {
        self.relevance_weight = relevance;
        self.recency_weight = recency;
        self.importance_weight = importance;
        self
    }

    /// Set the MMR lambda.
    pub fn with_diversity_lambda(mut self, lambda: f64) -> Self {
        self.diversity_lambda = lambda;
        self
    }

    /// Set the relevance floor.
    pub fn with_min_relevance(mut self, min_relevance: f64) -> Self {
        self.min_relevance = min_relevance;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("relevance_weight", self.relevance_weight),
            ("recency_weight", self.recency_weight),
            ("importance_weight", self.importance_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "must be between 0 and 1"));
            }
        }
        let sum = self.relevance_weight + self.recency_weight + self.importance_weight;
        if sum > 1.0 + 1e-9 {
            return Err(invalid(
                "relevance_weight + recency_weight + importance_weight",
                "must not exceed 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.diversity_lambda) {
            return Err(invalid("diversity_lambda", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(invalid("min_relevance", "must be between 0 and 1"));
        }
        if !(self.coverage_threshold > 0.0 && self.coverage_threshold <= 1.0) {
            return Err(invalid("coverage_threshold", "must be in (0, 1]"));
        }
        if self.max_knapsack_cells == 0 {
            return Err(invalid("max_knapsack_cells", "must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::config(format!("invalid value for {}: {}", field, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::default();
        assert_eq!(config.max_working_memory, 100);
        assert_eq!(config.max_episodic_memory, 1000);
        assert_eq!(config.consolidation_interval, Duration::from_secs(300));
        assert_eq!(config.similarity_threshold, 0.95);
        assert!(config.validate().is_ok());

        let pruner = PrunerConfig::default();
        assert_eq!(pruner.diversity_lambda, 0.3);
        assert_eq!(pruner.min_relevance, 0.1);
        assert!(pruner.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MemoryConfig::default()
            .with_capacities(5, 10)
            .with_ttls(Duration::from_millis(1000), Duration::from_secs(60))
            .with_promotion_threshold(4)
            .with_similarity_threshold(0.9);

        assert_eq!(config.max_working_memory, 5);
        assert_eq!(config.max_episodic_memory, 10);
        assert_eq!(config.working_ttl, Duration::from_millis(1000));
        assert_eq!(config.promotion_threshold, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_config_validation() {
        let mut config = MemoryConfig::default();
        config.max_working_memory = 0;
        assert!(config.validate().is_err());

        let config = MemoryConfig::default().with_similarity_threshold(0.0);
        assert!(config.validate().is_err());

        let config = MemoryConfig::default().with_similarity_threshold(1.5);
        assert!(config.validate().is_err());

        let config = MemoryConfig::default().with_cycle_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pruner_weights_may_sum_below_one() {
        let config = PrunerConfig::default().with_weights(0.4, 0.1, 0.1);
        assert!(config.validate().is_ok());

        let config = PrunerConfig::default().with_weights(0.6, 0.3, 0.3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed 1"));
    }

    #[test]
    fn test_pruner_lambda_validation() {
        assert!(PrunerConfig::default()
            .with_diversity_lambda(1.2)
            .validate()
            .is_err());
        assert!(PrunerConfig::default()
            .with_diversity_lambda(1.0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = MemoryConfig::default().with_cycle_timeout(Duration::from_secs(30));
        let json = serde_json::to_string(&config).unwrap();
        let back: MemoryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
