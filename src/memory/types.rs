//! Core memory types: MemoryLayer, MemoryEntry, NewMemory, stats and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Milliseconds in one day; the recency decay constant.
pub const DAY_MS: f64 = 86_400_000.0;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Retention tier. Declaration order is promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    /// Short-lived scratch memory, TTL and capacity bounded
    Working,
    /// Session events, TTL and capacity bounded
    Episodic,
    /// Durable facts
    Semantic,
    /// Durable procedures
    Skill,
}

impl MemoryLayer {
    /// All layers in promotion order.
    pub const ALL: [MemoryLayer; 4] = [
        MemoryLayer::Working,
        MemoryLayer::Episodic,
        MemoryLayer::Semantic,
        MemoryLayer::Skill,
    ];

    /// The next layer in promotion order, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Working => Some(Self::Episodic),
            Self::Episodic => Some(Self::Semantic),
            Self::Semantic => Some(Self::Skill),
            Self::Skill => None,
        }
    }

    /// Position in promotion order.
    pub fn index(self) -> usize {
        match self {
            Self::Working => 0,
            Self::Episodic => 1,
            Self::Semantic => 2,
            Self::Skill => 3,
        }
    }

    /// Whether entries in this layer carry a TTL and a hard capacity.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Working | Self::Episodic)
    }

    /// Retrieval weight; durable knowledge ranks above transient memory.
    pub fn weight(self) -> f64 {
        match self {
            Self::Working | Self::Episodic => 1.0,
            Self::Semantic | Self::Skill => 1.2,
        }
    }

    /// Convert to string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Skill => "skill",
        }
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MemoryLayer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "skill" => Ok(Self::Skill),
            other => Err(format!("unknown memory layer: {}", other)),
        }
    }
}

/// A single stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Stable unique id
    pub id: EntryId,
    /// Free text
    pub content: String,
    /// Tier the entry currently lives in
    pub layer: MemoryLayer,
    /// Optional fixed-length embedding
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    /// Caller-defined metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// When the entry was last read or reinforced
    pub last_accessed_at: DateTime<Utc>,
    /// Accesses since the entry entered its current tier
    pub access_count: u64,
    /// Importance in [0, 1]; never lowered automatically
    pub importance: f64,
    /// Expiry measured from `created_at`; only transient tiers carry one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl: Option<Duration>,
}

impl MemoryEntry {
    /// Absolute age of the entry. Clock skew yields zero, not a panic.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the entry has outlived its TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| self.age(now) > ttl)
    }

    /// Count a read.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    /// LRU ranking key; lower means less valuable.
    ///
    /// Each access is worth one second of recency.
    pub fn lru_rank(&self) -> i64 {
        let accesses = i64::try_from(self.access_count).unwrap_or(i64::MAX / 1000);
        self.last_accessed_at
            .timestamp_millis()
            .saturating_add(accesses.saturating_mul(1000))
    }

    /// Exponential recency decay in (0, 1] with a one-day constant.
    pub fn recency(&self, now: DateTime<Utc>) -> f64 {
        let idle_ms = (now - self.last_accessed_at).num_milliseconds().max(0) as f64;
        (-idle_ms / DAY_MS).exp()
    }

    /// Ranking score used by keyword retrieval:
    /// `importance * recency * tier weight * ln(access_count + 1)`.
    pub fn retrieval_score(&self, now: DateTime<Utc>) -> f64 {
        self.importance
            * self.recency(now)
            * self.layer.weight()
            * ((self.access_count as f64) + 1.0).ln()
    }
}

/// Input for storing a new memory.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub layer: MemoryLayer,
    pub metadata: HashMap<String, Value>,
    pub importance: Option<f64>,
    pub embedding: Option<Vec<f32>>,
}

impl NewMemory {
    /// Create a new memory destined for the given layer.
    pub fn new(content: impl Into<String>, layer: MemoryLayer) -> Self {
        Self {
            content: content.into(),
            layer,
            metadata: HashMap::new(),
            importance: None,
            embedding: None,
        }
    }

    /// Set importance (clamped to [0, 1]).
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Supply a precomputed embedding instead of calling the store's embedder.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Per-tier entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub working: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub skill: usize,
    pub total: usize,
}

impl MemoryStats {
    /// Count for a single layer.
    pub fn count(&self, layer: MemoryLayer) -> usize {
        match layer {
            MemoryLayer::Working => self.working,
            MemoryLayer::Episodic => self.episodic,
            MemoryLayer::Semantic => self.semantic,
            MemoryLayer::Skill => self.skill,
        }
    }
}

/// Full, lossless dump of a store's tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Format version
    pub version: u32,
    /// When the snapshot was taken
    pub exported_at: DateTime<Utc>,
    /// Embedding dimensionality fixed by the store, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dimensions: Option<usize>,
    pub working: Vec<MemoryEntry>,
    pub episodic: Vec<MemoryEntry>,
    pub semantic: Vec<MemoryEntry>,
    pub skill: Vec<MemoryEntry>,
}

impl MemorySnapshot {
    /// Create an empty snapshot.
    pub fn empty(exported_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            exported_at,
            dimensions: None,
            working: Vec::new(),
            episodic: Vec::new(),
            semantic: Vec::new(),
            skill: Vec::new(),
        }
    }

    /// Entries of one tier, in tier order.
    pub fn tier(&self, layer: MemoryLayer) -> &[MemoryEntry] {
        match layer {
            MemoryLayer::Working => &self.working,
            MemoryLayer::Episodic => &self.episodic,
            MemoryLayer::Semantic => &self.semantic,
            MemoryLayer::Skill => &self.skill,
        }
    }

    pub(crate) fn tier_mut(&mut self, layer: MemoryLayer) -> &mut Vec<MemoryEntry> {
        match layer {
            MemoryLayer::Working => &mut self.working,
            MemoryLayer::Episodic => &mut self.episodic,
            MemoryLayer::Semantic => &mut self.semantic,
            MemoryLayer::Skill => &mut self.skill,
        }
    }

    /// All entries, tier by tier.
    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        MemoryLayer::ALL
            .into_iter()
            .flat_map(move |layer| self.tier(layer).iter())
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        MemoryLayer::ALL
            .into_iter()
            .map(|layer| self.tier(layer).len())
            .sum()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
