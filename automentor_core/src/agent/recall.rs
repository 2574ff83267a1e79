//! Memory Manager
//!
//! Higher-level memory operations on top of [`MemoryStore`]: embedding under
//! a timeout, near-duplicate reinforcement, recency-weighted recall and
//! token-bounded context assembly.

use super::memory::{rank_order, DecayReport, MemoryStats, MemoryStore, Upsert};
use super::types::{MemoryKind, MemoryRecord};
use crate::capabilities::{CapabilityGuard, EmbeddingProvider};
use crate::config::MemoryConfig;
use crate::error::{AgentError, AgentResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on recall candidates considered for a context window
const CONTEXT_CANDIDATES: usize = 32;
/// Per-line token overhead for the bullet and kind tag
const LINE_OVERHEAD_TOKENS: usize = 2;

/// A recalled memory with its raw similarity and recency-weighted score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub record: MemoryRecord,
    pub similarity: f32,
    pub score: f32,
}

/// Context text assembled for a prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub text: String,
    pub included: Vec<String>,
    pub tokens_used: usize,
    pub truncated: bool,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

const PREFERENCE_PREFIX: &str = "Preference ";

fn parse_preference(text: &str) -> Option<(&str, &str)> {
    text.strip_prefix(PREFERENCE_PREFIX)?.split_once(": ")
}

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub struct MemoryManager {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    guard: CapabilityGuard,
    dedup_threshold: f32,
    reinforce_boost: f32,
    default_half_life: Duration,
}

impl MemoryManager {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        guard: CapabilityGuard,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            guard,
            dedup_threshold: config.dedup_threshold,
            reinforce_boost: config.reinforce_boost,
            default_half_life: config.recall_half_life(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn default_half_life(&self) -> Duration {
        self.default_half_life
    }

    pub fn remember(&self, user_id: &str, text: &str, kind: MemoryKind) -> AgentResult<Upsert> {
        self.remember_at(user_id, text, kind, Utc::now())
    }

    /// Store `text` for `user_id`, or reinforce an existing near-duplicate
    pub fn remember_at(
        &self,
        user_id: &str,
        text: &str,
        kind: MemoryKind,
        now: DateTime<Utc>,
    ) -> AgentResult<Upsert> {
        if user_id.trim().is_empty() {
            return Err(AgentError::validation("user_id is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::validation("memory text is empty"));
        }

        let embedding = self.guard.embed(&self.embedder, text)?;
        let record = MemoryRecord::new(user_id, text, embedding, kind).created(now);
        let outcome = self
            .store
            .add_or_reinforce(record, self.dedup_threshold, self.reinforce_boost)?;

        if let Upsert::Stored { id } = &outcome {
            log::debug!("[MEMORY] Remembered {} for {} ({})", id, user_id, kind.as_str());
        }
        Ok(outcome)
    }

    pub fn store_user_preference(&self, user_id: &str, key: &str, value: &str) -> AgentResult<Upsert> {
        self.store_user_preference_at(user_id, key, value, Utc::now())
    }

    /// Record `key: value` for `user_id`
    ///
    /// Restating the current value reinforces its record; a new value is
    /// always stored as a record of its own.
    pub fn store_user_preference_at(
        &self,
        user_id: &str,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> AgentResult<Upsert> {
        if user_id.trim().is_empty() {
            return Err(AgentError::validation("user_id is required"));
        }
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || key.contains(':') || key.contains('\n') {
            return Err(AgentError::validation(format!("invalid preference key '{}'", key)));
        }
        if value.is_empty() {
            return Err(AgentError::validation("preference value is empty"));
        }

        let current = self.store.user_records(user_id).into_iter().rev().find_map(|r| {
            if r.kind != MemoryKind::Preference {
                return None;
            }
            let (k, v) = parse_preference(&r.text)?;
            (k == key).then(|| (r.id.clone(), v == value))
        });
        if let Some((id, unchanged)) = current {
            if unchanged {
                self.store.boost_importance(&id, self.reinforce_boost)?;
                return Ok(Upsert::Reinforced { id, similarity: 1.0 });
            }
        }

        let text = format!("{}{}: {}", PREFERENCE_PREFIX, key, value);
        let embedding = self.guard.embed(&self.embedder, &text)?;
        let record = MemoryRecord::new(user_id, &text, embedding, MemoryKind::Preference).created(now);
        let id = self.store.add(record)?;
        log::debug!("[MEMORY] Preference {} set for {}", key, user_id);
        Ok(Upsert::Stored { id })
    }

    /// Latest value of every stored preference
    pub fn user_preferences(&self, user_id: &str) -> BTreeMap<String, String> {
        self.store
            .user_records(user_id)
            .iter()
            .filter(|r| r.kind == MemoryKind::Preference)
            .filter_map(|r| parse_preference(&r.text))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn recall(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        half_life: Duration,
    ) -> AgentResult<Vec<RecalledMemory>> {
        self.recall_at(user_id, query, k, half_life, Utc::now())
    }

    /// Top-`k` memories by similarity weighted with `0.5^(age / half_life)`
    pub fn recall_at(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        half_life: Duration,
        now: DateTime<Utc>,
    ) -> AgentResult<Vec<RecalledMemory>> {
        if half_life < Duration::milliseconds(1) {
            return Err(AgentError::validation("recency half-life must be at least 1ms"));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.guard.embed(&self.embedder, query)?;
        let candidates = self.store.search(user_id, &embedding, k.saturating_mul(2))?;

        let half_life_ms = half_life.num_milliseconds() as f64;
        let mut recalled: Vec<RecalledMemory> = candidates
            .into_iter()
            .map(|(record, similarity)| {
                let age_ms = (now - record.created_at).num_milliseconds().max(0) as f64;
                let recency = 0.5f64.powf(age_ms / half_life_ms) as f32;
                RecalledMemory {
                    score: similarity * recency,
                    similarity,
                    record,
                }
            })
            .collect();

        recalled.sort_by(|a, b| rank_order(a.score, &a.record, b.score, &b.record));
        recalled.truncate(k);
        Ok(recalled)
    }

    pub fn build_context(
        &self,
        user_id: &str,
        query: &str,
        max_tokens: usize,
    ) -> AgentResult<MemoryContext> {
        self.build_context_at(user_id, query, max_tokens, Utc::now())
    }

    /// Concatenate recalled memories in rank order until the budget is hit
    ///
    /// Stops at the first memory that does not fit, so the included set is
    /// always a prefix of the ranking.
    pub fn build_context_at(
        &self,
        user_id: &str,
        query: &str,
        max_tokens: usize,
        now: DateTime<Utc>,
    ) -> AgentResult<MemoryContext> {
        if max_tokens == 0 {
            return Ok(MemoryContext::default());
        }

        let recalled = self.recall_at(
            user_id,
            query,
            CONTEXT_CANDIDATES,
            self.default_half_life,
            now,
        )?;

        let mut context = MemoryContext::default();
        let mut lines = Vec::new();
        for memory in &recalled {
            let line = format!("- [{}] {}", memory.record.kind.as_str(), memory.record.text);
            let cost = estimate_tokens(&memory.record.text) + LINE_OVERHEAD_TOKENS;
            if context.tokens_used + cost > max_tokens {
                context.truncated = true;
                break;
            }
            context.tokens_used += cost;
            context.included.push(memory.record.id.clone());
            lines.push(line);
        }
        context.text = lines.join("\n");
        Ok(context)
    }

    pub fn stats(&self, user_id: &str) -> MemoryStats {
        self.store.stats(user_id)
    }

    pub fn cleanup(&self, now: DateTime<Utc>) -> DecayReport {
        self.store.decay(now)
    }

    pub fn persist(&self) -> AgentResult<usize> {
        self.store.persist()
    }
}
