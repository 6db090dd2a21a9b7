//! One consolidation cycle: evict, promote, merge, enforce capacity.

use crate::error::Result;
use crate::events::{EvictionReason, MemoryEvent};
use crate::memory::tiers::TierSet;
use crate::memory::{EntryId, MemoryLayer, TieredMemoryStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A step of the consolidation cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationPhase {
    /// Remove transient entries past their TTL
    Evict,
    /// Move frequently accessed transient entries forward
    Promote,
    /// Fold near-duplicate durable entries together
    Merge,
    /// Re-apply transient tier capacities
    Capacity,
}

impl ConsolidationPhase {
    /// Convert to string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evict => "evict",
            Self::Promote => "promote",
            Self::Merge => "merge",
            Self::Capacity => "capacity",
        }
    }
}

impl std::fmt::Display for ConsolidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Summary of one consolidation cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationResult {
    /// Entries moved one tier forward
    pub promoted: usize,
    /// Entries removed for age or capacity
    pub evicted: usize,
    /// Merges performed (one per removed duplicate)
    pub merged: usize,
    /// Wall time of the cycle
    pub duration: Duration,
    /// Another cycle was in flight, so this one did nothing
    pub skipped: bool,
    /// The cycle exceeded its timeout and was abandoned
    pub timed_out: bool,
    /// Phases that raised an error; their counts are zero
    pub failed_phases: Vec<ConsolidationPhase>,
}

impl ConsolidationResult {
    /// Zeroed result for a refused overlapping cycle.
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether every phase completed.
    pub fn is_success(&self) -> bool {
        !self.skipped && !self.timed_out && self.failed_phases.is_empty()
    }
}

/// Runs consolidation cycles against a shared store.
///
/// At most one cycle runs at a time; a call made while another is in flight
/// returns [`ConsolidationResult::skipped`] immediately.
#[derive(Debug)]
pub struct ConsolidationEngine {
    store: Arc<TieredMemoryStore>,
    running: AtomicBool,
    cycles: AtomicU64,
}

/// Clears the running flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConsolidationEngine {
    /// Create an engine for the given store.
    pub fn new(store: Arc<TieredMemoryStore>) -> Self {
        Self {
            store,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    /// The store this engine consolidates.
    pub fn store(&self) -> &Arc<TieredMemoryStore> {
        &self.store
    }

    /// Whether a cycle is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of cycles that have run to completion or timeout.
    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run one cycle now.
    ///
    /// Phase errors are reported through `failed_phases` and a
    /// `ConsolidationFailed` event; the remaining phases still run.
    pub async fn consolidate(&self) -> ConsolidationResult {
        let Some(_guard) = CycleGuard::acquire(&self.running) else {
            debug!("consolidation already running, skipping");
            return ConsolidationResult::skipped();
        };

        let started = Instant::now();
        let result = match self.store.config().cycle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_cycle(started)).await {
                Ok(result) => result,
                Err(_) => {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(timeout_ms, "consolidation cycle timed out");
                    self.store
                        .events()
                        .emit(MemoryEvent::ConsolidationTimedOut { timeout_ms });
                    ConsolidationResult {
                        duration: started.elapsed(),
                        timed_out: true,
                        ..ConsolidationResult::default()
                    }
                }
            },
            None => self.run_cycle(started).await,
        };

        self.cycles.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn run_cycle(&self, started: Instant) -> ConsolidationResult {
        let store = &self.store;
        let mut tiers = store.tiers.write().await;
        let now = store.clock().now();
        let mut result = ConsolidationResult::default();

        let outcome = self.evict_expired(&mut tiers, now);
        let count = self.settle(ConsolidationPhase::Evict, outcome, &mut result);
        result.evicted += count;

        let mut promoted = HashSet::new();
        let outcome = self.promote_ready(&mut tiers, &mut promoted);
        let count = self.settle(ConsolidationPhase::Promote, outcome, &mut result);
        result.promoted += count;

        // One tier at a time: a skill failure keeps semantic's count.
        for layer in [MemoryLayer::Semantic, MemoryLayer::Skill] {
            let outcome = self.merge_duplicates(&mut tiers, layer);
            let count = self.settle(ConsolidationPhase::Merge, outcome, &mut result);
            result.merged += count;
        }

        let outcome = self.enforce_capacity(&mut tiers, &promoted);
        let count = self.settle(ConsolidationPhase::Capacity, outcome, &mut result);
        result.evicted += count;

        drop(tiers);
        result.duration = started.elapsed();

        info!(
            promoted = result.promoted,
            evicted = result.evicted,
            merged = result.merged,
            duration_ms = result.duration.as_millis() as u64,
            failed = result.failed_phases.len(),
            "consolidation cycle complete"
        );
        store
            .events()
            .emit(MemoryEvent::ConsolidationCompleted(result.clone()));
        result
    }

    fn settle(
        &self,
        phase: ConsolidationPhase,
        outcome: Result<usize>,
        result: &mut ConsolidationResult,
    ) -> usize {
        match outcome {
            Ok(count) => count,
            Err(e) => {
                warn!(phase = %phase, error = %e, "consolidation phase failed");
                if !result.failed_phases.contains(&phase) {
                    result.failed_phases.push(phase);
                }
                self.store.events().emit(MemoryEvent::ConsolidationFailed {
                    phase,
                    message: e.to_string(),
                });
                0
            }
        }
    }

    fn evict_expired(&self, tiers: &mut TierSet, now: DateTime<Utc>) -> Result<usize> {
        let mut evicted = 0;
        for layer in [MemoryLayer::Working, MemoryLayer::Episodic] {
            for entry in tiers.take_expired(layer, now) {
                debug!(id = %entry.id, layer = %layer, "evicted expired memory");
                self.store.events().emit(MemoryEvent::Evicted {
                    id: entry.id,
                    layer,
                    reason: EvictionReason::Expired,
                });
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn promote_ready(
        &self,
        tiers: &mut TierSet,
        promoted_ids: &mut HashSet<EntryId>,
    ) -> Result<usize> {
        let threshold = self.store.config().promotion_threshold;
        let mut promoted = 0;
        // Working first: an entry promoted into episodic arrives with zero
        // accesses and cannot move twice in one cycle.
        for layer in [MemoryLayer::Working, MemoryLayer::Episodic] {
            let Some(target) = layer.next() else {
                continue;
            };
            let ready: Vec<_> = tiers
                .tier(layer)
                .iter()
                .filter(|e| e.access_count >= threshold)
                .map(|e| e.id.clone())
                .collect();
            for id in ready {
                if self.store.promote_locked(tiers, &id, target).is_some() {
                    promoted_ids.insert(id);
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    /// Merge one durable tier. A failure leaves that tier unchanged.
    fn merge_duplicates(&self, tiers: &mut TierSet, layer: MemoryLayer) -> Result<usize> {
        let threshold = self.store.config().similarity_threshold;
        let merges = tiers.merge_duplicates(layer, threshold)?;
        for (kept, removed) in &merges {
            debug!(kept = %kept, removed = %removed, layer = %layer, "merged memories");
            self.store.events().emit(MemoryEvent::Merged {
                kept: kept.clone(),
                removed: removed.clone(),
                layer,
            });
        }
        Ok(merges.len())
    }

    /// Entries promoted this cycle are evicted only if nothing else can go.
    fn enforce_capacity(
        &self,
        tiers: &mut TierSet,
        promoted: &HashSet<EntryId>,
    ) -> Result<usize> {
        Ok([MemoryLayer::Working, MemoryLayer::Episodic]
            .into_iter()
            .map(|layer| self.store.enforce_capacity_locked(tiers, layer, promoted))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MemoryConfig;
    use crate::memory::NewMemory;
    use pretty_assertions::assert_eq;

    fn engine_with(config: MemoryConfig) -> (Arc<ConsolidationEngine>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = TieredMemoryStore::new(config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (Arc::new(ConsolidationEngine::new(Arc::new(store))), clock)
    }

    #[tokio::test]
    async fn test_ttl_eviction_scenario() {
        let config = MemoryConfig::default()
            .with_ttls(Duration::from_millis(1000), Duration::from_secs(60));
        let (engine, clock) = engine_with(config);
        engine
            .store()
            .store(NewMemory::new("short lived", MemoryLayer::Working))
            .await
            .unwrap();

        clock.advance_ms(1500);
        let result = engine.consolidate().await;

        assert_eq!(result.evicted, 1);
        assert!(result.is_success());
        assert!(engine.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_ttl_is_absolute_age() {
        let config = MemoryConfig::default()
            .with_ttls(Duration::from_millis(1000), Duration::from_secs(60))
            .with_promotion_threshold(100);
        let (engine, clock) = engine_with(config);
        let id = engine
            .store()
            .store(NewMemory::new("busy", MemoryLayer::Working))
            .await
            .unwrap();

        clock.advance_ms(900);
        engine.store().get(&id).await;
        clock.advance_ms(200);

        let result = engine.consolidate().await;
        assert_eq!(result.evicted, 1);
    }

    #[tokio::test]
    async fn test_promotion_one_tier_per_cycle() {
        let config = MemoryConfig::default().with_promotion_threshold(3);
        let (engine, _clock) = engine_with(config);
        let store = engine.store();
        let id = store
            .store(NewMemory::new("hot entry", MemoryLayer::Working))
            .await
            .unwrap();
        store.get(&id).await;
        store.get(&id).await;

        let result = engine.consolidate().await;
        assert_eq!(result.promoted, 1);
        let entry = store.peek(&id).await.unwrap();
        assert_eq!(entry.layer, MemoryLayer::Episodic);
        assert_eq!(entry.access_count, 0);

        let result = engine.consolidate().await;
        assert_eq!(result.promoted, 0);
    }

    #[tokio::test]
    async fn test_episodic_promotes_to_semantic_without_ttl() {
        let config = MemoryConfig::default().with_promotion_threshold(2);
        let (engine, _clock) = engine_with(config);
        let store = engine.store();
        let id = store
            .store(NewMemory::new("decision", MemoryLayer::Episodic))
            .await
            .unwrap();
        store.get(&id).await;

        engine.consolidate().await;
        let entry = store.peek(&id).await.unwrap();
        assert_eq!(entry.layer, MemoryLayer::Semantic);
        assert_eq!(entry.ttl, None);
    }

    #[tokio::test]
    async fn test_merge_reports_each_merge() {
        let (engine, _clock) = engine_with(MemoryConfig::default());
        let store = engine.store();
        let mut rx = store.subscribe();

        // Distinct at store time under the default threshold.
        for text in ["alpha beta gamma", "alpha beta gamma delta", "epsilon"] {
            store
                .store(NewMemory::new(text, MemoryLayer::Semantic))
                .await
                .unwrap();
        }

        // Drift: the second entry's text is rewritten to match the first.
        {
            let mut tiers = store.tiers.write().await;
            tiers.tier_mut(MemoryLayer::Semantic)[1].content = "Alpha, beta, gamma.".into();
        }

        let result = engine.consolidate().await;
        assert_eq!(result.merged, 1);
        assert_eq!(store.stats().await.semantic, 2);

        let mut merges = 0;
        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                MemoryEvent::Merged { .. } => merges += 1,
                MemoryEvent::ConsolidationCompleted(r) => completed = Some(r),
                _ => {}
            }
        }
        assert_eq!(merges, 1);
        assert_eq!(completed, Some(result));
    }

    #[tokio::test]
    async fn test_merge_count_kept_when_later_tier_fails() {
        let (engine, _clock) = engine_with(MemoryConfig::default());
        let store = engine.store();
        let mut rx = store.subscribe();

        for text in ["alpha beta gamma", "alpha beta gamma delta"] {
            store
                .store(NewMemory::new(text, MemoryLayer::Semantic))
                .await
                .unwrap();
        }
        for text in ["skill one", "skill two"] {
            store
                .store(NewMemory::new(text, MemoryLayer::Skill))
                .await
                .unwrap();
        }
        {
            let mut tiers = store.tiers.write().await;
            tiers.tier_mut(MemoryLayer::Semantic)[1].content = "alpha beta gamma".into();
            let skill = tiers.tier_mut(MemoryLayer::Skill);
            skill[0].embedding = Some(vec![1.0, 0.0, 0.0]);
            skill[1].embedding = Some(vec![1.0, 0.0]);
        }

        let result = engine.consolidate().await;
        assert_eq!(result.merged, 1);
        assert_eq!(result.failed_phases, vec![ConsolidationPhase::Merge]);

        let stats = store.stats().await;
        assert_eq!(stats.semantic, 1);
        assert_eq!(stats.skill, 2);

        let merges = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, MemoryEvent::Merged { .. }))
            .count();
        assert_eq!(merges, 1);
    }

    #[tokio::test]
    async fn test_promoted_entry_survives_full_tier() {
        let config = MemoryConfig::default()
            .with_capacities(10, 2)
            .with_promotion_threshold(3);
        let (engine, clock) = engine_with(config);
        let store = engine.store();

        let mut residents = Vec::new();
        for text in ["resident one", "resident two"] {
            clock.advance_ms(10);
            let id = store
                .store(NewMemory::new(text, MemoryLayer::Episodic))
                .await
                .unwrap();
            residents.push(id);
        }
        let hot = store
            .store(NewMemory::new("hot entry", MemoryLayer::Working))
            .await
            .unwrap();
        store.get(&hot).await;
        store.get(&hot).await;

        let result = engine.consolidate().await;
        assert_eq!(result.promoted, 1);
        assert_eq!(result.evicted, 1);
        assert_eq!(store.layer_of(&hot).await, Some(MemoryLayer::Episodic));
        assert!(store.peek(&residents[0]).await.is_none());
        assert!(store.peek(&residents[1]).await.is_some());
    }

    #[tokio::test]
    async fn test_empty_cycle_still_reports() {
        let (engine, _clock) = engine_with(MemoryConfig::default());
        let mut rx = engine.store().subscribe();

        let result = engine.consolidate().await;
        assert_eq!(result.promoted + result.evicted + result.merged, 0);
        assert!(!result.skipped);
        assert!(matches!(
            rx.try_recv().unwrap(),
            MemoryEvent::ConsolidationCompleted(_)
        ));
        assert_eq!(engine.cycles_run(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let (engine, _clock) = engine_with(MemoryConfig::default());
        let held = engine.store().tiers.write().await;

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.consolidate().await }
        });
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        let second = engine.consolidate().await;
        assert!(second.skipped);
        assert_eq!(second.promoted + second.evicted + second.merged, 0);

        drop(held);
        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_phase_failure_keeps_other_counts_and_releases_guard() {
        let config = MemoryConfig::default()
            .with_ttls(Duration::from_millis(1000), Duration::from_secs(60));
        let (engine, clock) = engine_with(config);
        let store = engine.store();
        let mut rx = store.subscribe();

        store
            .store(NewMemory::new("stale", MemoryLayer::Working))
            .await
            .unwrap();
        store
            .store(NewMemory::new("fact one", MemoryLayer::Semantic))
            .await
            .unwrap();
        store
            .store(NewMemory::new("fact two", MemoryLayer::Semantic))
            .await
            .unwrap();
        {
            let mut tiers = store.tiers.write().await;
            let semantic = tiers.tier_mut(MemoryLayer::Semantic);
            semantic[0].embedding = Some(vec![1.0, 0.0, 0.0]);
            semantic[1].embedding = Some(vec![1.0, 0.0]);
        }

        clock.advance_ms(1500);
        let result = engine.consolidate().await;
        assert_eq!(result.evicted, 1);
        assert_eq!(result.merged, 0);
        assert_eq!(result.failed_phases, vec![ConsolidationPhase::Merge]);
        assert!(!engine.is_running());

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MemoryEvent::ConsolidationFailed { phase, message } = event {
                failed.push((phase, message));
            }
        }
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, ConsolidationPhase::Merge);
        assert!(failed[0].1.contains("dimension mismatch"));

        // Guard released: the next cycle runs.
        let again = engine.consolidate().await;
        assert!(!again.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_releases_guard() {
        let config = MemoryConfig::default().with_cycle_timeout(Duration::from_millis(100));
        let (engine, _clock) = engine_with(config);
        let mut rx = engine.store().subscribe();
        let held = engine.store().tiers.write().await;

        let result = engine.consolidate().await;
        assert!(result.timed_out);
        assert!(!result.is_success());
        assert!(!engine.is_running());
        assert!(matches!(
            rx.try_recv().unwrap(),
            MemoryEvent::ConsolidationTimedOut { timeout_ms: 100 }
        ));

        drop(held);
        let result = engine.consolidate().await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_capacity_phase_is_safety_net() {
        let config = MemoryConfig::default().with_capacities(2, 10);
        let (engine, _clock) = engine_with(config);
        let store = engine.store();
        for text in ["one", "two"] {
            store
                .store(NewMemory::new(text, MemoryLayer::Working))
                .await
                .unwrap();
        }

        // Force an over-capacity tier past the store's own checks.
        {
            let mut tiers = store.tiers.write().await;
            let mut extra = tiers.tier(MemoryLayer::Working)[0].clone();
            extra.id = crate::memory::EntryId::new();
            extra.content = "three".into();
            tiers.insert(extra).unwrap();
        }

        let result = engine.consolidate().await;
        assert_eq!(result.evicted, 1);
        assert_eq!(store.stats().await.working, 2);
    }
}
