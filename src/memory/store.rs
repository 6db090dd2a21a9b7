//! Tiered memory store.

use super::persist::SqliteSnapshotStore;
use super::tiers::TierSet;
use super::types::{EntryId, MemoryEntry, MemoryLayer, MemorySnapshot, MemoryStats, NewMemory};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::events::{EventBus, EvictionReason, MemoryEvent};
use crate::similarity::{cosine_similarity, words};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Minimum length of a query word used by the fallback keyword match.
const MIN_QUERY_WORD_LEN: usize = 3;

/// Four-tier memory store with deduplication and capacity enforcement.
///
/// All tier mutations happen under one async `RwLock`. Embeddings are
/// computed before the lock is taken, so a slow embedder never blocks
/// readers or the consolidation engine.
pub struct TieredMemoryStore {
    config: MemoryConfig,
    pub(crate) tiers: RwLock<TierSet>,
    clock: Arc<dyn Clock>,
    embedder: Option<Arc<dyn Embedder>>,
    events: EventBus,
}

impl TieredMemoryStore {
    /// Create an empty store.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            config,
            tiers: RwLock::new(TierSet::new()),
            clock: Arc::new(SystemClock),
            embedder: None,
            events,
        })
    }

    /// Use a custom clock for timestamps, TTLs and recency.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Embed stored content and enable [`retrieve_similar`](Self::retrieve_similar).
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Store configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The store's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Event bus carrying this store's notifications.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn ttl_for(&self, layer: MemoryLayer) -> Option<Duration> {
        match layer {
            MemoryLayer::Working => Some(self.config.working_ttl),
            MemoryLayer::Episodic => Some(self.config.episodic_ttl),
            MemoryLayer::Semantic | MemoryLayer::Skill => None,
        }
    }

    pub(crate) fn capacity_for(&self, layer: MemoryLayer) -> Option<usize> {
        match layer {
            MemoryLayer::Working => Some(self.config.max_working_memory),
            MemoryLayer::Episodic => Some(self.config.max_episodic_memory),
            MemoryLayer::Semantic | MemoryLayer::Skill => None,
        }
    }

    // ==================== Writes ====================

    /// Store a memory, or reinforce an existing duplicate in the same tier.
    ///
    /// Returns the id of the new entry, or of the existing entry when the
    /// content was a duplicate. A duplicate gains one access and keeps the
    /// higher of the two importances; the new content is discarded.
    pub async fn store(&self, memory: NewMemory) -> Result<EntryId> {
        let NewMemory {
            content,
            layer,
            metadata,
            importance,
            embedding,
        } = memory;

        let embedding = match (embedding, &self.embedder) {
            (Some(embedding), _) => Some(embedding),
            (None, Some(embedder)) => Some(embedder.embed(&content).await?),
            (None, None) => None,
        };
        let importance = importance
            .unwrap_or(self.config.default_importance)
            .clamp(0.0, 1.0);

        let mut tiers = self.tiers.write().await;
        let now = self.clock.now();

        if let (Some(expected), Some(embedding)) = (tiers.dimensions(), &embedding) {
            if embedding.len() != expected {
                return Err(Error::dimension_mismatch(expected, embedding.len()));
            }
        }

        if let Some(existing) = tiers.find_duplicate(
            layer,
            &content,
            embedding.as_deref(),
            self.config.similarity_threshold,
        )? {
            let entry = tiers
                .get_mut(&existing)
                .ok_or_else(|| Error::Internal(format!("index lost entry {}", existing)))?;
            entry.record_access(now);
            entry.importance = entry.importance.max(importance);
            let access_count = entry.access_count;

            debug!(id = %existing, layer = %layer, access_count, "deduplicated memory");
            self.events.emit(MemoryEvent::Deduplicated {
                id: existing.clone(),
                layer,
                access_count,
            });
            return Ok(existing);
        }

        let id = EntryId::new();
        tiers.insert(MemoryEntry {
            id: id.clone(),
            content,
            layer,
            embedding,
            metadata,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            importance,
            ttl: self.ttl_for(layer),
        })?;

        debug!(id = %id, layer = %layer, "stored memory");
        self.events.emit(MemoryEvent::Stored {
            id: id.clone(),
            layer,
        });

        self.enforce_capacity_locked(&mut tiers, layer, &HashSet::from([id.clone()]));
        Ok(id)
    }

    /// Move an entry strictly forward to `target`.
    ///
    /// Returns `false` without changing anything if the id is unknown or the
    /// target is not later than the entry's current tier. A full target tier
    /// makes room by evicting other entries, never the promoted one.
    pub async fn promote(&self, id: &EntryId, target: MemoryLayer) -> bool {
        let mut tiers = self.tiers.write().await;
        if self.promote_locked(&mut tiers, id, target).is_none() {
            return false;
        }
        self.enforce_capacity_locked(&mut tiers, target, &HashSet::from([id.clone()]));
        true
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn delete(&self, id: &EntryId) -> bool {
        let mut tiers = self.tiers.write().await;
        match tiers.remove(id) {
            Some(entry) => {
                debug!(id = %id, layer = %entry.layer, "deleted memory");
                self.events.emit(MemoryEvent::Evicted {
                    id: entry.id,
                    layer: entry.layer,
                    reason: EvictionReason::Deleted,
                });
                true
            }
            None => false,
        }
    }

    /// Tier move without capacity enforcement; caller holds the lock.
    pub(crate) fn promote_locked(
        &self,
        tiers: &mut TierSet,
        id: &EntryId,
        target: MemoryLayer,
    ) -> Option<MemoryLayer> {
        let current = tiers.layer_of(id)?;
        if target <= current {
            return None;
        }
        let from = tiers.move_entry(id, target, self.ttl_for(target))?;

        debug!(id = %id, from = %from, to = %target, "promoted memory");
        self.events.emit(MemoryEvent::Promoted {
            id: id.clone(),
            from,
            to: target,
        });
        Some(from)
    }

    /// Evict down to the tier's capacity, keeping `spare` while anything else
    /// can go; caller holds the lock.
    pub(crate) fn enforce_capacity_locked(
        &self,
        tiers: &mut TierSet,
        layer: MemoryLayer,
        spare: &HashSet<EntryId>,
    ) -> usize {
        let Some(capacity) = self.capacity_for(layer) else {
            return 0;
        };
        let evicted = tiers.enforce_capacity(layer, capacity, spare);
        for entry in &evicted {
            debug!(id = %entry.id, layer = %layer, "evicted memory over capacity");
            self.events.emit(MemoryEvent::Evicted {
                id: entry.id.clone(),
                layer,
                reason: EvictionReason::Capacity,
            });
        }
        evicted.len()
    }

    // ==================== Reads ====================

    /// Keyword retrieval across `layers` (all tiers when `None`).
    ///
    /// An entry matches when it contains the whole query case-insensitively,
    /// or when at least half of the query's words of three or more characters
    /// appear in it. Matches are ranked by retrieval score and the top `k`
    /// returned; each returned entry counts as one access.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        layers: Option<&[MemoryLayer]>,
    ) -> Vec<MemoryEntry> {
        if k == 0 {
            return Vec::new();
        }

        let query_lower = query.to_lowercase();
        let query_words: Vec<String> = words(query)
            .into_iter()
            .filter(|w| w.chars().count() >= MIN_QUERY_WORD_LEN)
            .collect();
        let layers = layers.unwrap_or(&MemoryLayer::ALL);

        let mut tiers = self.tiers.write().await;
        let now = self.clock.now();

        let mut hits: Vec<(EntryId, f64)> = Vec::new();
        for layer in MemoryLayer::ALL.into_iter().filter(|l| layers.contains(l)) {
            for entry in tiers.tier(layer) {
                if keyword_match(&entry.content, &query_lower, &query_words) {
                    hits.push((entry.id.clone(), entry.retrieval_score(now)));
                }
            }
        }

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        let results = self.touch_all(&mut tiers, hits.iter().map(|(id, _)| id), now);
        debug!(query, matched = results.len(), "keyword retrieval");
        results
    }

    /// Embedding retrieval: the `k` entries with cosine similarity to the
    /// query of at least `min_similarity`, most similar first.
    ///
    /// Requires an embedder. Entries without an embedding are skipped. Each
    /// returned entry counts as one access.
    pub async fn retrieve_similar(
        &self,
        query: &str,
        k: usize,
        layers: Option<&[MemoryLayer]>,
        min_similarity: f64,
    ) -> Result<Vec<(MemoryEntry, f64)>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::embedding("no embedder configured"))?;
        let query_embedding = embedder.embed(query).await?;
        let layers = layers.unwrap_or(&MemoryLayer::ALL);

        let mut tiers = self.tiers.write().await;
        let now = self.clock.now();

        if let Some(expected) = tiers.dimensions() {
            if query_embedding.len() != expected {
                return Err(Error::dimension_mismatch(expected, query_embedding.len()));
            }
        }

        let mut hits: Vec<(EntryId, f64)> = Vec::new();
        for layer in MemoryLayer::ALL.into_iter().filter(|l| layers.contains(l)) {
            for entry in tiers.tier(layer) {
                let Some(embedding) = entry.embedding.as_deref() else {
                    continue;
                };
                let similarity = cosine_similarity(&query_embedding, embedding)?;
                if similarity >= min_similarity {
                    hits.push((entry.id.clone(), similarity));
                }
            }
        }

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        let entries = self.touch_all(&mut tiers, hits.iter().map(|(id, _)| id), now);
        Ok(entries
            .into_iter()
            .zip(hits.into_iter().map(|(_, similarity)| similarity))
            .collect())
    }

    fn touch_all<'a>(
        &self,
        tiers: &mut TierSet,
        ids: impl Iterator<Item = &'a EntryId>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<MemoryEntry> {
        ids.filter_map(|id| {
            let entry = tiers.get_mut(id)?;
            entry.record_access(now);
            Some(entry.clone())
        })
        .collect()
    }

    /// Look up an entry by id. Counts as an access.
    pub async fn get(&self, id: &EntryId) -> Option<MemoryEntry> {
        let mut tiers = self.tiers.write().await;
        let now = self.clock.now();
        let entry = tiers.get_mut(id)?;
        entry.record_access(now);
        Some(entry.clone())
    }

    /// Look up an entry without counting an access.
    pub async fn peek(&self, id: &EntryId) -> Option<MemoryEntry> {
        self.tiers.read().await.get(id).cloned()
    }

    /// Tier an entry currently lives in.
    pub async fn layer_of(&self, id: &EntryId) -> Option<MemoryLayer> {
        self.tiers.read().await.layer_of(id)
    }

    /// Per-tier counts.
    pub async fn stats(&self) -> MemoryStats {
        self.tiers.read().await.stats()
    }

    /// Total number of entries.
    pub async fn len(&self) -> usize {
        self.tiers.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ==================== Export / Import ====================

    /// Snapshot every tier.
    pub async fn export(&self) -> MemorySnapshot {
        let tiers = self.tiers.read().await;
        tiers.to_snapshot(self.clock.now())
    }

    /// Replace the store's contents with a snapshot.
    ///
    /// The snapshot is validated in full before anything changes; on error
    /// the store is left exactly as it was.
    pub async fn import(&self, snapshot: MemorySnapshot) -> Result<()> {
        let mut incoming = TierSet::from_snapshot(snapshot)?;

        if let (Some(embedder), Some(dimensions)) = (&self.embedder, incoming.dimensions()) {
            if embedder.dimensions() != dimensions {
                return Err(Error::dimension_mismatch(embedder.dimensions(), dimensions));
            }
        }

        // Entries trimmed here were never part of this store, so no events.
        let mut trimmed = 0;
        for layer in MemoryLayer::ALL {
            if let Some(capacity) = self.capacity_for(layer) {
                trimmed += incoming.enforce_capacity(layer, capacity, &HashSet::new()).len();
            }
        }

        let mut tiers = self.tiers.write().await;
        *tiers = incoming;

        info!(entries = tiers.len(), trimmed, "imported memory snapshot");
        Ok(())
    }

    /// Export as JSON.
    pub async fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export().await)?)
    }

    /// Import from JSON produced by [`export_json`](Self::export_json).
    pub async fn import_json(&self, json: &str) -> Result<()> {
        let snapshot: MemorySnapshot = serde_json::from_str(json)?;
        self.import(snapshot).await
    }

    /// Save a snapshot to SQLite.
    pub async fn persist_to(&self, db: &SqliteSnapshotStore) -> Result<()> {
        let snapshot = self.export().await;
        db.save(&snapshot)
    }

    /// Load the snapshot saved in SQLite, if any. Returns whether one was found.
    pub async fn restore_from(&self, db: &SqliteSnapshotStore) -> Result<bool> {
        match db.load()? {
            Some(snapshot) => {
                self.import(snapshot).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for TieredMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredMemoryStore")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field(
                "embedder",
                &self.embedder.as_ref().map(|e| e.model_name().to_string()),
            )
            .finish_non_exhaustive()
    }
}

fn keyword_match(content: &str, query_lower: &str, query_words: &[String]) -> bool {
    let content_lower = content.to_lowercase();
    if content_lower.contains(query_lower) {
        return true;
    }
    if query_words.is_empty() {
        return false;
    }
    let found = query_words
        .iter()
        .filter(|w| content_lower.contains(w.as_str()))
        .count();
    found * 2 >= query_words.len()
}
