//! SQLite-backed snapshot persistence.
//!
//! A [`SqliteSnapshotStore`] holds at most one [`MemorySnapshot`]. `save`
//! replaces it atomically; `load` reads it back with timestamps, embeddings
//! and tier order intact.

use super::schema::{initialize_schema, is_initialized};
use super::types::{EntryId, MemoryEntry, MemoryLayer, MemorySnapshot};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// SQLite file (or in-memory database) holding one memory snapshot.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

/// A row as stored, before validation.
struct RawEntry {
    id: String,
    layer: String,
    content: String,
    embedding: Option<Vec<u8>>,
    metadata: String,
    created_at: String,
    last_accessed_at: String,
    access_count: i64,
    importance: f64,
    ttl_nanos: Option<i64>,
}

impl SqliteSnapshotStore {
    /// Open or create a snapshot database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory snapshot database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))
    }

    /// Replace the stored snapshot in a single transaction.
    pub fn save(&self, snapshot: &MemorySnapshot) -> Result<()> {
        // Encode outside the connection lock so serde failures stay typed.
        let mut rows = Vec::with_capacity(snapshot.len());
        for layer in MemoryLayer::ALL {
            for (position, entry) in snapshot.tier(layer).iter().enumerate() {
                rows.push((position as i64, encode_entry(entry)?));
            }
        }
        let dimensions = snapshot.dimensions.map(|d| d as i64);

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM memory_entries", [])?;
            tx.execute("DELETE FROM snapshot_meta", [])?;

            tx.execute(
                "INSERT INTO snapshot_meta (id, version, exported_at, dimensions)
                 VALUES (1, ?1, ?2, ?3)",
                params![
                    snapshot.version,
                    format_timestamp(snapshot.exported_at),
                    dimensions
                ],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO memory_entries (
                        id, layer, position, content, embedding, metadata,
                        created_at, last_accessed_at, access_count, importance, ttl_nanos
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for (position, row) in &rows {
                    stmt.execute(params![
                        row.id,
                        row.layer,
                        position,
                        row.content,
                        row.embedding,
                        row.metadata,
                        row.created_at,
                        row.last_accessed_at,
                        row.access_count,
                        row.importance,
                        row.ttl_nanos,
                    ])?;
                }
            }

            tx.commit()
        })?;

        tracing::debug!(entries = rows.len(), "memory snapshot saved");
        Ok(())
    }

    /// Load the stored snapshot, if one has been saved.
    pub fn load(&self) -> Result<Option<MemorySnapshot>> {
        let loaded = self.with_conn(|conn| {
            let header = conn
                .query_row(
                    "SELECT version, exported_at, dimensions FROM snapshot_meta WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, u32>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some(header) = header else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT id, layer, content, embedding, metadata, created_at,
                        last_accessed_at, access_count, importance, ttl_nanos
                 FROM memory_entries ORDER BY layer, position",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RawEntry {
                        id: row.get(0)?,
                        layer: row.get(1)?,
                        content: row.get(2)?,
                        embedding: row.get(3)?,
                        metadata: row.get(4)?,
                        created_at: row.get(5)?,
                        last_accessed_at: row.get(6)?,
                        access_count: row.get(7)?,
                        importance: row.get(8)?,
                        ttl_nanos: row.get(9)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some((header, rows)))
        })?;

        let Some(((version, exported_at, dimensions), rows)) = loaded else {
            return Ok(None);
        };

        let mut snapshot = MemorySnapshot::empty(parse_timestamp(&exported_at)?);
        snapshot.version = version;
        snapshot.dimensions = dimensions
            .map(|d| {
                usize::try_from(d)
                    .map_err(|_| Error::invalid_snapshot(format!("bad dimensions {}", d)))
            })
            .transpose()?;

        // ORDER BY layer sorts by name; place rows by their layer instead.
        for raw in rows {
            let entry = decode_entry(raw)?;
            snapshot.tier_mut(entry.layer).push(entry);
        }

        tracing::debug!(entries = snapshot.len(), "memory snapshot loaded");
        Ok(Some(snapshot))
    }

    /// Delete the stored snapshot.
    pub fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memory_entries", [])?;
            conn.execute("DELETE FROM snapshot_meta", [])?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for SqliteSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSnapshotStore").finish_non_exhaustive()
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid_snapshot(format!("bad timestamp {:?}: {}", s, e)))
}

fn encode_entry(entry: &MemoryEntry) -> Result<RawEntry> {
    let ttl_nanos = entry
        .ttl
        .map(|ttl| {
            i64::try_from(ttl.as_nanos())
                .map_err(|_| Error::invalid_snapshot(format!("ttl of {} too large", entry.id)))
        })
        .transpose()?;

    Ok(RawEntry {
        id: entry.id.to_string(),
        layer: entry.layer.as_str().to_string(),
        content: entry.content.clone(),
        embedding: entry
            .embedding
            .as_ref()
            .map(|e| e.iter().flat_map(|f| f.to_le_bytes()).collect()),
        metadata: serde_json::to_string(&entry.metadata)?,
        created_at: format_timestamp(entry.created_at),
        last_accessed_at: format_timestamp(entry.last_accessed_at),
        access_count: i64::try_from(entry.access_count).unwrap_or(i64::MAX),
        importance: entry.importance,
        ttl_nanos,
    })
}

fn decode_entry(raw: RawEntry) -> Result<MemoryEntry> {
    let id = EntryId::parse(&raw.id)
        .map_err(|e| Error::invalid_snapshot(format!("bad entry id {:?}: {}", raw.id, e)))?;
    let layer: MemoryLayer = raw.layer.parse().map_err(Error::invalid_snapshot)?;

    let embedding = raw
        .embedding
        .map(|bytes| {
            if bytes.len() % 4 != 0 {
                return Err(Error::invalid_snapshot(format!(
                    "embedding of {} is {} bytes, not a multiple of 4",
                    id,
                    bytes.len()
                )));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect())
        })
        .transpose()?;

    let metadata: HashMap<String, Value> = serde_json::from_str(&raw.metadata)?;

    let access_count = u64::try_from(raw.access_count)
        .map_err(|_| Error::invalid_snapshot(format!("negative access count on {}", id)))?;
    let ttl = raw
        .ttl_nanos
        .map(|nanos| {
            u64::try_from(nanos)
                .map(Duration::from_nanos)
                .map_err(|_| Error::invalid_snapshot(format!("negative ttl on {}", id)))
        })
        .transpose()?;

    Ok(MemoryEntry {
        id,
        content: raw.content,
        layer,
        embedding,
        metadata,
        created_at: parse_timestamp(&raw.created_at)?,
        last_accessed_at: parse_timestamp(&raw.last_accessed_at)?,
        access_count,
        importance: raw.importance,
        ttl,
    })
}
