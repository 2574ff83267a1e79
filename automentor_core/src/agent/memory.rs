//! Agent Memory Module
//!
//! Owns every embedded memory record and answers similarity queries over
//! them. Records are held in a read-mostly in-process index; changes are
//! tracked and flushed to SQLite (a vector table plus a parallel metadata
//! table keyed by record id) in a single transaction per `persist()`.

use super::types::{MemoryKind, MemoryRecord};
use crate::config::MemoryConfig;
use crate::error::{AgentError, AgentResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================
// DECAY POLICY
// ============================================================

/// Importance decay and garbage-collection rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayPolicy {
    pub unit: Duration,
    pub factor: f32,
    pub floor: f32,
    pub horizon: Duration,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl From<&MemoryConfig> for DecayPolicy {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            unit: Duration::days(config.decay_unit_days),
            factor: config.decay_factor,
            floor: config.importance_floor,
            horizon: Duration::days(config.retention_horizon_days),
        }
    }
}

/// Outcome of one decay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    pub decayed: usize,
    pub removed: usize,
}

/// Result of an atomic insert-or-reinforce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Upsert {
    Stored { id: String },
    Reinforced { id: String, similarity: f32 },
}

impl Upsert {
    pub fn id(&self) -> &str {
        match self {
            Upsert::Stored { id } | Upsert::Reinforced { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub average_importance: f32,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

// ============================================================
// IN-PROCESS INDEX
// ============================================================

#[derive(Debug, Clone)]
struct Entry {
    record: MemoryRecord,
    /// Decay has been applied up to this instant
    decayed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, Entry>,
    dim: Option<usize>,
    dirty: HashSet<String>,
    removed: HashSet<String>,
}

impl Index {
    fn touch(&mut self, id: &str) {
        self.removed.remove(id);
        self.dirty.insert(id.to_string());
    }

    fn forget(&mut self, id: &str) {
        self.entries.remove(id);
        self.dirty.remove(id);
        self.removed.insert(id.to_string());
    }

    fn insert(&mut self, record: MemoryRecord) -> AgentResult<String> {
        check_dimension(self.dim, &record.embedding)?;
        if self.entries.contains_key(&record.id) {
            return Err(AgentError::validation(format!(
                "memory record {} already exists",
                record.id
            )));
        }
        self.dim.get_or_insert(record.embedding.len());

        let id = record.id.clone();
        let decayed_at = record.created_at;
        self.entries.insert(id.clone(), Entry { record, decayed_at });
        self.touch(&id);
        Ok(id)
    }

    fn boost(&mut self, id: &str, delta: f32) -> AgentResult<f32> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| AgentError::not_found(format!("memory {}", id)))?;
        entry.record.importance = (entry.record.importance + delta).clamp(0.0, 1.0);
        let importance = entry.record.importance;
        self.touch(id);
        Ok(importance)
    }
}

// ============================================================
// MEMORY STORE
// ============================================================

/// Embedded memory index with SQLite persistence
pub struct MemoryStore {
    index: RwLock<Index>,
    conn: Arc<Mutex<Connection>>,
    policy: DecayPolicy,
}

impl MemoryStore {
    /// Open (or create) a store backed by a SQLite file and load its contents
    pub fn open(db_path: impl AsRef<Path>, policy: DecayPolicy) -> AgentResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self::with_connection(conn, policy)?;
        store.load()?;
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub fn in_memory(policy: DecayPolicy) -> AgentResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, policy)
    }

    fn with_connection(conn: Connection, policy: DecayPolicy) -> AgentResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            index: RwLock::new(Index::default()),
            conn: Arc::new(Mutex::new(conn)),
            policy,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> DecayPolicy {
        self.policy
    }

    /// Embedding dimension fixed by the first stored record
    pub fn dimension(&self) -> Option<usize> {
        self.read().dim
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.read().entries.get(id).map(|e| e.record.clone())
    }

    /// Store a new record and return its id
    pub fn add(&self, record: MemoryRecord) -> AgentResult<String> {
        validate_record(&record)?;
        let id = self.write().insert(record)?;
        log::debug!("[MEMORY] Stored record {}", id);
        Ok(id)
    }

    /// Insert `record` unless the same user already holds a record at least
    /// `threshold` similar, in which case that record is boosted instead.
    /// The check and the write happen under one write lock.
    pub fn add_or_reinforce(
        &self,
        record: MemoryRecord,
        threshold: f32,
        boost: f32,
    ) -> AgentResult<Upsert> {
        validate_record(&record)?;
        let mut index = self.write();
        check_dimension(index.dim, &record.embedding)?;

        let nearest = index
            .entries
            .values()
            .filter(|e| e.record.user_id == record.user_id)
            .map(|e| (e.record.id.clone(), cosine_similarity(&record.embedding, &e.record.embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((id, similarity)) = nearest {
            if similarity >= threshold {
                let importance = index.boost(&id, boost)?;
                log::debug!(
                    "[MEMORY] Reinforced {} (similarity {:.3}, importance {:.2})",
                    id,
                    similarity,
                    importance
                );
                return Ok(Upsert::Reinforced { id, similarity });
            }
        }

        let id = index.insert(record)?;
        Ok(Upsert::Stored { id })
    }

    pub fn boost_importance(&self, id: &str, delta: f32) -> AgentResult<f32> {
        self.write().boost(id, delta)
    }

    /// Top-`k` records of `user_id` by cosine similarity to `query`
    ///
    /// Candidates are restricted to the user before ranking. Exact score ties
    /// go to the more recent record, then to the smaller id.
    pub fn search(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
    ) -> AgentResult<Vec<(MemoryRecord, f32)>> {
        validate_embedding(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let index = self.read();
        check_dimension(index.dim, query)?;

        let mut scored: Vec<(MemoryRecord, f32)> = index
            .entries
            .values()
            .filter(|e| e.record.user_id == user_id)
            .map(|e| {
                let score = cosine_similarity(query, &e.record.embedding);
                (e.record.clone(), score)
            })
            .collect();
        drop(index);

        scored.sort_by(|(ra, sa), (rb, sb)| rank_order(*sa, ra, *sb, rb));
        scored.truncate(k);
        Ok(scored)
    }

    /// All records of one user, oldest first
    pub fn user_records(&self, user_id: &str) -> Vec<MemoryRecord> {
        let mut records: Vec<MemoryRecord> = self
            .read()
            .entries
            .values()
            .filter(|e| e.record.user_id == user_id)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Apply importance decay up to `now` and drop expired records
    ///
    /// Each whole `unit` elapsed since a record was last decayed multiplies
    /// its importance by `factor`. A record is deleted once its importance is
    /// below `floor` and it is at least `horizon` old.
    pub fn decay(&self, now: DateTime<Utc>) -> DecayReport {
        let policy = self.policy;
        let unit_secs = policy.unit.num_seconds().max(1);
        let mut index = self.write();
        let mut report = DecayReport::default();
        let mut expired = Vec::new();

        let mut touched = Vec::new();
        for (id, entry) in index.entries.iter_mut() {
            let elapsed = (now - entry.decayed_at).num_seconds();
            if elapsed >= unit_secs {
                let units = elapsed / unit_secs;
                entry.record.importance *= policy.factor.powi(units as i32);
                entry.decayed_at += Duration::seconds(units * unit_secs);
                report.decayed += 1;
                touched.push(id.clone());
            }

            let age = now - entry.record.created_at;
            if entry.record.importance < policy.floor && age >= policy.horizon {
                expired.push(id.clone());
            }
        }

        for id in touched {
            index.touch(&id);
        }
        for id in &expired {
            index.forget(id);
        }
        report.removed = expired.len();

        if report.decayed > 0 || report.removed > 0 {
            log::info!(
                "[MEMORY] Decay pass: {} decayed, {} removed",
                report.decayed,
                report.removed
            );
        }
        report
    }

    pub fn stats(&self, user_id: &str) -> MemoryStats {
        let index = self.read();
        let records: Vec<&MemoryRecord> = index
            .entries
            .values()
            .map(|e| &e.record)
            .filter(|r| r.user_id == user_id)
            .collect();

        let mut by_kind = BTreeMap::new();
        for record in &records {
            *by_kind.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
        }
        let average_importance = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.importance).sum::<f32>() / records.len() as f32
        };

        MemoryStats {
            total: records.len(),
            by_kind,
            average_importance,
            oldest: records.iter().map(|r| r.created_at).min(),
            newest: records.iter().map(|r| r.created_at).max(),
        }
    }

    // ============================================================
    // PERSISTENCE
    // ============================================================

    /// Flush pending changes to SQLite in one transaction
    pub fn persist(&self) -> AgentResult<usize> {
        let (upserts, removals) = {
            let index = self.read();
            let upserts: Vec<Entry> = index
                .dirty
                .iter()
                .filter_map(|id| index.entries.get(id).cloned())
                .collect();
            let removals: Vec<String> = index.removed.iter().cloned().collect();
            (upserts, removals)
        };
        if upserts.is_empty() && removals.is_empty() {
            return Ok(0);
        }

        {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            for id in &removals {
                tx.execute("DELETE FROM memory_vectors WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM memory_metadata WHERE id = ?1", params![id])?;
            }
            for entry in &upserts {
                let record = &entry.record;
                tx.execute(
                    "INSERT OR REPLACE INTO memory_vectors (id, dim, vector) VALUES (?1, ?2, ?3)",
                    params![
                        record.id,
                        record.embedding.len() as i64,
                        encode_vector(&record.embedding)
                    ],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO memory_metadata
                        (id, user_id, text, kind, created_at, importance, decayed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.id,
                        record.user_id,
                        record.text,
                        record.kind.as_str(),
                        record.created_at.to_rfc3339(),
                        record.importance as f64,
                        entry.decayed_at.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
        }

        // Only clear what was flushed; writes that raced the flush stay dirty
        let mut index = self.write();
        for entry in &upserts {
            let unchanged = index
                .entries
                .get(&entry.record.id)
                .map(|current| current.record == entry.record && current.decayed_at == entry.decayed_at)
                .unwrap_or(false);
            if unchanged {
                index.dirty.remove(&entry.record.id);
            }
        }
        for id in &removals {
            if !index.entries.contains_key(id) {
                index.removed.remove(id);
            }
        }

        let written = upserts.len() + removals.len();
        log::debug!("[MEMORY] Persisted {} changes", written);
        Ok(written)
    }

    /// Replace the in-process index with the persisted contents
    pub fn load(&self) -> AgentResult<usize> {
        let entries = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, m.text, m.kind, m.created_at, m.importance,
                        m.decayed_at, v.dim, v.vector
                 FROM memory_metadata m
                 JOIN memory_vectors v ON v.id = m.id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Vec<u8>>(8)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, user_id, text, kind, created_at, importance, decayed_at, dim, blob) = row?;
                let embedding = decode_vector(&blob, dim as usize)
                    .ok_or_else(|| AgentError::validation(format!("corrupt vector for memory {}", id)))?;
                let kind: MemoryKind = kind.parse()?;
                let record = MemoryRecord {
                    id,
                    user_id,
                    text,
                    embedding,
                    kind,
                    created_at: parse_timestamp(&created_at)?,
                    importance: importance as f32,
                };
                entries.push(Entry {
                    record,
                    decayed_at: parse_timestamp(&decayed_at)?,
                });
            }
            entries
        };

        let mut index = Index::default();
        for entry in entries {
            check_dimension(index.dim, &entry.record.embedding)?;
            index.dim.get_or_insert(entry.record.embedding.len());
            index.entries.insert(entry.record.id.clone(), entry);
        }
        let count = index.entries.len();
        *self.write() = index;

        log::info!("[MEMORY] Loaded {} records", count);
        Ok(count)
    }
}

// ============================================================
// HELPERS
// ============================================================

fn init_schema(conn: &Connection) -> AgentResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_vectors (
            id TEXT PRIMARY KEY,
            dim INTEGER NOT NULL,
            vector BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS memory_metadata (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            text TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL,
            importance REAL NOT NULL,
            decayed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_user_id ON memory_metadata(user_id);",
    )?;
    Ok(())
}

fn validate_embedding(embedding: &[f32]) -> AgentResult<()> {
    if embedding.is_empty() {
        return Err(AgentError::validation("embedding is empty"));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(AgentError::validation("embedding contains NaN or infinite values"));
    }
    Ok(())
}

fn validate_record(record: &MemoryRecord) -> AgentResult<()> {
    if record.user_id.trim().is_empty() {
        return Err(AgentError::validation("memory record has no user_id"));
    }
    if !(0.0..=1.0).contains(&record.importance) {
        return Err(AgentError::validation("importance must be in [0, 1]"));
    }
    validate_embedding(&record.embedding)
}

fn check_dimension(expected: Option<usize>, embedding: &[f32]) -> AgentResult<()> {
    match expected {
        Some(dim) if dim != embedding.len() => Err(AgentError::validation(format!(
            "embedding dimension {} does not match store dimension {}",
            embedding.len(),
            dim
        ))),
        _ => Ok(()),
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Descending score, then newer first, then id
pub(crate) fn rank_order(sa: f32, ra: &MemoryRecord, sb: f32, rb: &MemoryRecord) -> Ordering {
    sb.total_cmp(&sa)
        .then_with(|| rb.created_at.cmp(&ra.created_at))
        .then_with(|| ra.id.cmp(&rb.id))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim * 4 || dim == 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn parse_timestamp(value: &str) -> AgentResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AgentError::validation(format!("bad timestamp '{}': {}", value, e)))
}

// ============================================================
// TESTS
// ============================================================
