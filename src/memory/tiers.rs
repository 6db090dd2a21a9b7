//! In-memory tier maps.
//!
//! `TierSet` is the only shared mutable state of a store. Every method is
//! synchronous; callers hold the store's lock for the whole of a multi-step
//! mutation so no entry is ever observed in two tiers or in none.

use crate::error::{Error, Result};
use crate::memory::types::{EntryId, MemoryEntry, MemoryLayer, MemorySnapshot, MemoryStats, SNAPSHOT_VERSION};
use crate::similarity::{common_dimension, cosine_similarity, jaccard_of_sets, word_set};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Four ordered tiers plus an id index.
#[derive(Debug, Default)]
pub(crate) struct TierSet {
    tiers: [Vec<MemoryEntry>; 4],
    index: HashMap<EntryId, MemoryLayer>,
    dimensions: Option<usize>,
}

impl TierSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tier(&self, layer: MemoryLayer) -> &[MemoryEntry] {
        &self.tiers[layer.index()]
    }

    /// Mutable access for in-place field updates. Callers must not add or
    /// remove entries through this; use `insert`/`remove`/`move_entry`.
    pub(crate) fn tier_mut(&mut self, layer: MemoryLayer) -> &mut [MemoryEntry] {
        &mut self.tiers[layer.index()]
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub(crate) fn stats(&self) -> MemoryStats {
        let count = |layer: MemoryLayer| self.tier(layer).len();
        MemoryStats {
            working: count(MemoryLayer::Working),
            episodic: count(MemoryLayer::Episodic),
            semantic: count(MemoryLayer::Semantic),
            skill: count(MemoryLayer::Skill),
            total: self.len(),
        }
    }

    pub(crate) fn layer_of(&self, id: &EntryId) -> Option<MemoryLayer> {
        self.index.get(id).copied()
    }

    fn position(&self, id: &EntryId) -> Option<(MemoryLayer, usize)> {
        let layer = self.layer_of(id)?;
        let pos = self.tier(layer).iter().position(|e| &e.id == id)?;
        Some((layer, pos))
    }

    pub(crate) fn get(&self, id: &EntryId) -> Option<&MemoryEntry> {
        let (layer, pos) = self.position(id)?;
        self.tier(layer).get(pos)
    }

    pub(crate) fn get_mut(&mut self, id: &EntryId) -> Option<&mut MemoryEntry> {
        let (layer, pos) = self.position(id)?;
        self.tiers[layer.index()].get_mut(pos)
    }

    /// Accept an embedding, fixing the set's dimensionality on first use.
    pub(crate) fn check_dimensions(&mut self, embedding: &[f32]) -> Result<()> {
        match self.dimensions {
            Some(dim) if dim != embedding.len() => {
                Err(Error::dimension_mismatch(dim, embedding.len()))
            }
            Some(_) => Ok(()),
            None => {
                self.dimensions = Some(embedding.len());
                Ok(())
            }
        }
    }

    /// Append an entry to the tier named by its `layer`.
    pub(crate) fn insert(&mut self, entry: MemoryEntry) -> Result<()> {
        if self.index.contains_key(&entry.id) {
            return Err(Error::Internal(format!("duplicate entry id {}", entry.id)));
        }
        if let Some(embedding) = &entry.embedding {
            self.check_dimensions(embedding)?;
        }
        self.index.insert(entry.id.clone(), entry.layer);
        self.tiers[entry.layer.index()].push(entry);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: &EntryId) -> Option<MemoryEntry> {
        let (layer, pos) = self.position(id)?;
        self.index.remove(id);
        Some(self.tiers[layer.index()].remove(pos))
    }

    /// Move an entry to another tier in one step.
    ///
    /// Resets the access count and sets the TTL the destination requires.
    /// Returns the source layer, or `None` if the id is unknown.
    pub(crate) fn move_entry(
        &mut self,
        id: &EntryId,
        target: MemoryLayer,
        ttl: Option<std::time::Duration>,
    ) -> Option<MemoryLayer> {
        let (from, pos) = self.position(id)?;
        let mut entry = self.tiers[from.index()].remove(pos);
        entry.layer = target;
        entry.access_count = 0;
        entry.ttl = ttl;
        self.index.insert(entry.id.clone(), target);
        self.tiers[target.index()].push(entry);
        Some(from)
    }

    /// Find an entry in `layer` that duplicates the given content.
    ///
    /// Exact text always matches. Otherwise durable tiers compare embeddings
    /// by cosine when both sides have one; everything else uses word-set
    /// Jaccard.
    pub(crate) fn find_duplicate(
        &self,
        layer: MemoryLayer,
        content: &str,
        embedding: Option<&[f32]>,
        threshold: f64,
    ) -> Result<Option<EntryId>> {
        let words = word_set(content);
        let probe = Probe {
            content,
            embedding,
            words: &words,
        };
        for existing in self.tier(layer) {
            let existing_words = word_set(&existing.content);
            let other = Probe::of(existing, &existing_words);
            if content_similarity(layer, &probe, &other)? >= threshold {
                return Ok(Some(existing.id.clone()));
            }
        }
        Ok(None)
    }

    /// Fold near-duplicate entries of `layer` into one another.
    ///
    /// The entry with more accesses survives, the earlier one on a tie. It
    /// absorbs the loser's access count and keeps the higher importance and
    /// the later access time. Returns `(kept, removed)` per merge. Mixed
    /// embedding dimensions fail before anything is touched.
    pub(crate) fn merge_duplicates(
        &mut self,
        layer: MemoryLayer,
        threshold: f64,
    ) -> Result<Vec<(EntryId, EntryId)>> {
        let tier = &mut self.tiers[layer.index()];
        common_dimension(tier.iter().filter_map(|e| e.embedding.as_deref()))?;

        let mut words: Vec<HashSet<String>> = tier.iter().map(|e| word_set(&e.content)).collect();
        let mut merges = Vec::new();

        let mut i = 0;
        'outer: while i < tier.len() {
            let mut j = i + 1;
            while j < tier.len() {
                let sim = content_similarity(
                    layer,
                    &Probe::of(&tier[i], &words[i]),
                    &Probe::of(&tier[j], &words[j]),
                )?;
                if sim < threshold {
                    j += 1;
                    continue;
                }

                if tier[j].access_count > tier[i].access_count {
                    let loser = tier.remove(i);
                    words.remove(i);
                    self.index.remove(&loser.id);
                    let keeper = &mut tier[j - 1];
                    merges.push((keeper.id.clone(), loser.id.clone()));
                    absorb(keeper, loser);
                    // The entry now at `i` has not been compared yet.
                    continue 'outer;
                }

                let loser = tier.remove(j);
                words.remove(j);
                self.index.remove(&loser.id);
                merges.push((tier[i].id.clone(), loser.id.clone()));
                absorb(&mut tier[i], loser);
            }
            i += 1;
        }

        Ok(merges)
    }

    /// Evict the lowest-ranked entries of `layer` until it fits `capacity`.
    ///
    /// Ranking is ascending `lru_rank`, ties broken by tier order. Entries in
    /// `spare` go last, and only when nothing else is left to evict.
    pub(crate) fn enforce_capacity(
        &mut self,
        layer: MemoryLayer,
        capacity: usize,
        spare: &HashSet<EntryId>,
    ) -> Vec<MemoryEntry> {
        let tier = &mut self.tiers[layer.index()];
        let excess = tier.len().saturating_sub(capacity);
        if excess == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..tier.len()).collect();
        order.sort_by_key(|&i| (spare.contains(&tier[i].id), tier[i].lru_rank(), i));
        let victims: HashSet<usize> = order.into_iter().take(excess).collect();

        let mut kept = Vec::with_capacity(capacity);
        let mut evicted = Vec::with_capacity(excess);
        for (i, entry) in std::mem::take(tier).into_iter().enumerate() {
            if victims.contains(&i) {
                evicted.push(entry);
            } else {
                kept.push(entry);
            }
        }
        *tier = kept;

        for entry in &evicted {
            self.index.remove(&entry.id);
        }
        evicted
    }

    /// Remove and return every entry of `layer` that has outlived its TTL.
    pub(crate) fn take_expired(&mut self, layer: MemoryLayer, now: DateTime<Utc>) -> Vec<MemoryEntry> {
        let tier = &mut self.tiers[layer.index()];
        let (expired, live): (Vec<_>, Vec<_>) =
            std::mem::take(tier).into_iter().partition(|e| e.is_expired(now));
        *tier = live;
        for entry in &expired {
            self.index.remove(&entry.id);
        }
        expired
    }

    pub(crate) fn to_snapshot(&self, exported_at: DateTime<Utc>) -> MemorySnapshot {
        let mut snapshot = MemorySnapshot::empty(exported_at);
        snapshot.dimensions = self.dimensions;
        for layer in MemoryLayer::ALL {
            *snapshot.tier_mut(layer) = self.tier(layer).to_vec();
        }
        snapshot
    }

    /// Build a tier set from a snapshot, rejecting anything inconsistent.
    pub(crate) fn from_snapshot(snapshot: MemorySnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::invalid_snapshot(format!(
                "unsupported version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let mut set = Self::new();
        set.dimensions = snapshot.dimensions;

        let MemorySnapshot {
            working,
            episodic,
            semantic,
            skill,
            ..
        } = snapshot;

        for (layer, entries) in MemoryLayer::ALL
            .into_iter()
            .zip([working, episodic, semantic, skill])
        {
            for entry in entries {
                validate_entry(layer, &entry)?;
                set.insert(entry).map_err(|e| match e {
                    Error::Internal(msg) => Error::invalid_snapshot(msg),
                    Error::DimensionMismatch { expected, actual } => Error::invalid_snapshot(
                        format!("embedding dimension {} does not match {}", actual, expected),
                    ),
                    other => other,
                })?;
            }
        }

        Ok(set)
    }
}

/// Text and optional embedding of one side of a similarity comparison.
struct Probe<'a> {
    content: &'a str,
    embedding: Option<&'a [f32]>,
    words: &'a HashSet<String>,
}

impl<'a> Probe<'a> {
    fn of(entry: &'a MemoryEntry, words: &'a HashSet<String>) -> Self {
        Self {
            content: &entry.content,
            embedding: entry.embedding.as_deref(),
            words,
        }
    }
}

/// Similarity used for dedup and merge decisions within one tier.
///
/// Exact text is 1.0. Semantic and skill tiers use cosine when both sides are
/// embedded; working and episodic tiers always use word-set Jaccard.
fn content_similarity(layer: MemoryLayer, a: &Probe<'_>, b: &Probe<'_>) -> Result<f64> {
    if a.content == b.content {
        return Ok(1.0);
    }
    match (layer.is_transient(), a.embedding, b.embedding) {
        (false, Some(x), Some(y)) => cosine_similarity(x, y),
        _ => Ok(jaccard_of_sets(a.words, b.words)),
    }
}

fn absorb(keeper: &mut MemoryEntry, loser: MemoryEntry) {
    keeper.access_count = keeper.access_count.saturating_add(loser.access_count);
    keeper.importance = keeper.importance.max(loser.importance);
    keeper.last_accessed_at = keeper.last_accessed_at.max(loser.last_accessed_at);
    for (key, value) in loser.metadata {
        keeper.metadata.entry(key).or_insert(value);
    }
}

fn validate_entry(layer: MemoryLayer, entry: &MemoryEntry) -> Result<()> {
    if entry.layer != layer {
        return Err(Error::invalid_snapshot(format!(
            "entry {} is listed under {} but claims layer {}",
            entry.id, layer, entry.layer
        )));
    }
    if !entry.importance.is_finite() || !(0.0..=1.0).contains(&entry.importance) {
        return Err(Error::invalid_snapshot(format!(
            "entry {} has importance {} outside [0, 1]",
            entry.id, entry.importance
        )));
    }
    match (layer.is_transient(), entry.ttl) {
        (true, None) => Err(Error::invalid_snapshot(format!(
            "entry {} in {} has no ttl",
            entry.id, layer
        ))),
        (false, Some(_)) => Err(Error::invalid_snapshot(format!(
            "entry {} in {} must not carry a ttl",
            entry.id, layer
        ))),
        _ => Ok(()),
    }
}
