//! Conflict detection records and resolution strategies
//!
//! A conflict is a set of divergent versions sharing one origin key. The
//! strategies are a closed set, so resolution is a `match` over
//! [`ConflictStrategy`] rather than a trait object. Every strategy is a pure
//! function of the candidate set: no clocks, no randomness.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentPriority;
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, OriginKey};
use crate::storage::{self, KvStore, CONFLICT_PREFIX};

/// How divergent versions are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Greatest `updated_at`, then greatest `version`
    LatestWins,

    /// Greatest `importance`, ties broken by latest-wins
    HighestImportance,

    /// Owner with the highest registry priority, ties broken by latest-wins
    AgentPriority,

    /// Nothing applied until an explicit resolution arrives
    ManualReview,

    /// Structural merge of every candidate
    MergeContent,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::LatestWins => write!(f, "latest-wins"),
            ConflictStrategy::HighestImportance => write!(f, "highest-importance"),
            ConflictStrategy::AgentPriority => write!(f, "agent-priority"),
            ConflictStrategy::ManualReview => write!(f, "manual-review"),
            ConflictStrategy::MergeContent => write!(f, "merge-content"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "latest-wins" => Ok(ConflictStrategy::LatestWins),
            "highest-importance" => Ok(ConflictStrategy::HighestImportance),
            "agent-priority" => Ok(ConflictStrategy::AgentPriority),
            "manual-review" => Ok(ConflictStrategy::ManualReview),
            "merge-content" => Ok(ConflictStrategy::MergeContent),
            _ => Err(Error::invalid_input(format!("Unknown conflict strategy: {}", s))),
        }
    }
}

/// Outcome of running a strategy over a candidate set
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The single authoritative version
    Resolved(MemoryRecord),

    /// Held for manual review
    Deferred,
}

/// An operator's answer to a manual-review conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    /// Re-run resolution with an automatic strategy
    Strategy(ConflictStrategy),

    /// Keep the candidate with this memory id
    Candidate(String),

    /// Replace the content outright
    Content(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// A detected divergence between versions sharing an origin key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,

    /// First candidate, for callers that think in memory ids
    pub memory_id: String,

    pub origin_key: OriginKey,

    /// Agent whose sync pass detected the divergence
    pub detected_by: String,

    /// Candidate snapshots ordered by memory id
    pub candidate_versions: Vec<MemoryRecord>,

    pub strategy_used: ConflictStrategy,

    pub status: ConflictStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<MemoryRecord>,

    pub detected_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// Open a new conflict over `candidates`
    pub fn new(
        origin_key: OriginKey,
        detected_by: impl Into<String>,
        mut candidates: Vec<MemoryRecord>,
        strategy: ConflictStrategy,
    ) -> Self {
        candidates.sort_by(|a, b| a.memory_id.cmp(&b.memory_id));
        Self {
            conflict_id: Uuid::new_v4().to_string(),
            memory_id: candidates
                .first()
                .map(|c| c.memory_id.clone())
                .unwrap_or_default(),
            origin_key,
            detected_by: detected_by.into(),
            candidate_versions: candidates,
            strategy_used: strategy,
            status: ConflictStatus::Pending,
            resolved_version: None,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Record the authoritative version
    pub fn resolve(&mut self, resolved: MemoryRecord, strategy: ConflictStrategy) {
        self.status = ConflictStatus::Resolved;
        self.strategy_used = strategy;
        self.resolved_version = Some(resolved);
        self.resolved_at = Some(Utc::now());
    }

    /// Agents owning at least one candidate
    pub fn agents(&self) -> BTreeSet<String> {
        self.candidate_versions
            .iter()
            .map(|c| c.owner_agent_id.clone())
            .collect()
    }

    pub fn candidate_ids(&self) -> Vec<String> {
        self.candidate_versions
            .iter()
            .map(|c| c.memory_id.clone())
            .collect()
    }
}

/// Total order used by latest-wins and as the tie breaker for every other strategy.
/// The memory id comparison is reversed so the smaller id wins a full tie.
fn latest_cmp(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then(a.version.cmp(&b.version))
        .then_with(|| b.memory_id.cmp(&a.memory_id))
}

/// Run `strategy` over `candidates`.
///
/// `priority_of` maps an owner agent id to its registry priority.
pub fn resolve<F>(
    candidates: &[MemoryRecord],
    strategy: ConflictStrategy,
    priority_of: F,
) -> Result<Resolution>
where
    F: Fn(&str) -> AgentPriority,
{
    if candidates.is_empty() {
        return Err(Error::invalid_input("cannot resolve an empty candidate set"));
    }

    let winner = match strategy {
        ConflictStrategy::ManualReview => return Ok(Resolution::Deferred),
        ConflictStrategy::MergeContent => return Ok(Resolution::Resolved(merge(candidates))),
        ConflictStrategy::LatestWins => candidates.iter().max_by(|a, b| latest_cmp(a, b)),
        ConflictStrategy::HighestImportance => candidates.iter().max_by(|a, b| {
            a.importance
                .total_cmp(&b.importance)
                .then_with(|| latest_cmp(a, b))
        }),
        ConflictStrategy::AgentPriority => candidates.iter().max_by(|a, b| {
            priority_of(&a.owner_agent_id)
                .cmp(&priority_of(&b.owner_agent_id))
                .then_with(|| latest_cmp(a, b))
        }),
    };

    winner
        .cloned()
        .map(Resolution::Resolved)
        .ok_or_else(|| Error::invalid_input("no winning candidate"))
}

fn sentence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^.!?\n]+[.!?]*").expect("sentence pattern is valid"))
}

/// Dedup key for a sentence: lowercase, whitespace collapsed, trailing punctuation dropped
fn normalize_sentence(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_lowercase()
}

/// Concatenate contents in order, dropping sentences already seen
pub fn merge_sentences<'a, I>(contents: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::new();

    for content in contents {
        for m in sentence_pattern().find_iter(content) {
            let sentence = m.as_str().trim();
            let key = normalize_sentence(sentence);
            if key.is_empty() {
                continue;
            }
            if seen.insert(key) {
                kept.push(sentence.to_string());
            }
        }
    }

    kept.join(" ")
}

fn merge(candidates: &[MemoryRecord]) -> MemoryRecord {
    let mut ordered: Vec<&MemoryRecord> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then(a.version.cmp(&b.version))
            .then_with(|| a.memory_id.cmp(&b.memory_id))
    });

    // The most recent candidate supplies identity and metadata
    let latest = ordered[ordered.len() - 1];
    let mut merged = latest.clone();

    merged.set_content(merge_sentences(ordered.iter().map(|c| c.content.as_str())));
    merged.tags = ordered.iter().flat_map(|c| c.tags.iter().cloned()).collect();
    merged.importance = ordered.iter().map(|c| c.importance).fold(0.0, f32::max);
    merged.confidence = ordered.iter().map(|c| c.confidence).fold(0.0, f32::max);
    merged.version = ordered.iter().map(|c| c.version).max().unwrap_or(0) + 1;

    merged
}

/// Conflict table with persistence and counters
pub struct ConflictResolver {
    store: Arc<dyn KvStore>,
    conflicts: RwLock<HashMap<String, Conflict>>,
    detected: AtomicU64,
    resolved: AtomicU64,
}

impl ConflictResolver {
    /// Load previously recorded conflicts from the store
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let loaded: Vec<Conflict> = storage::scan_json(store.as_ref(), CONFLICT_PREFIX)?;
        let pending = loaded.iter().filter(|c| c.is_pending()).count();
        tracing::info!(conflicts = loaded.len(), pending, "Loaded conflict table");

        Ok(Self {
            store,
            conflicts: RwLock::new(
                loaded
                    .into_iter()
                    .map(|c| (c.conflict_id.clone(), c))
                    .collect(),
            ),
            detected: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
        })
    }

    /// Persist and index a conflict
    pub fn record(&self, conflict: Conflict) -> Result<Conflict> {
        let mut conflicts = self
            .conflicts
            .write()
            .map_err(|e| Error::storage(e.to_string()))?;

        storage::put_json(
            self.store.as_ref(),
            &format!("{}{}", CONFLICT_PREFIX, conflict.conflict_id),
            &conflict,
        )?;

        let is_new = !conflicts.contains_key(&conflict.conflict_id);
        if is_new {
            self.detected.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if !conflict.is_pending() {
            self.resolved.fetch_add(1, AtomicOrdering::Relaxed);
        }
        conflicts.insert(conflict.conflict_id.clone(), conflict.clone());

        Ok(conflict)
    }

    pub fn get(&self, conflict_id: &str) -> Result<Conflict> {
        let conflicts = self
            .conflicts
            .read()
            .map_err(|e| Error::storage(e.to_string()))?;
        conflicts
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("conflict {}", conflict_id)))
    }

    /// Conflicts awaiting manual review, oldest first
    pub fn pending(&self) -> Vec<Conflict> {
        let Ok(conflicts) = self.conflicts.read() else {
            return Vec::new();
        };
        let mut pending: Vec<Conflict> = conflicts
            .values()
            .filter(|c| c.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        pending
    }

    /// Every known conflict, newest first
    pub fn list(&self) -> Vec<Conflict> {
        let Ok(conflicts) = self.conflicts.read() else {
            return Vec::new();
        };
        let mut all: Vec<Conflict> = conflicts.values().cloned().collect();
        all.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        all
    }

    /// The open conflict for an origin key, if any
    pub fn pending_for_origin(&self, origin_key: &OriginKey) -> Option<Conflict> {
        let conflicts = self.conflicts.read().ok()?;
        conflicts
            .values()
            .find(|c| c.is_pending() && &c.origin_key == origin_key)
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.conflicts
            .read()
            .map(|c| c.values().filter(|c| c.is_pending()).count())
            .unwrap_or(0)
    }

    /// Conflicts detected since process start
    pub fn detected_count(&self) -> u64 {
        self.detected.load(AtomicOrdering::Relaxed)
    }

    /// Conflicts resolved since process start
    pub fn resolved_count(&self) -> u64 {
        self.resolved.load(AtomicOrdering::Relaxed)
    }
}
