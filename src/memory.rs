//! Memory record types shared by every component

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Type of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Something that happened in a conversation
    Episodic,

    /// A fact or piece of knowledge
    Semantic,

    /// A workflow or process
    Procedural,

    /// Short-lived scratch state, expires
    Working,

    /// Situational context (location, device, environment)
    Contextual,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Episodic => write!(f, "episodic"),
            MemoryType::Semantic => write!(f, "semantic"),
            MemoryType::Procedural => write!(f, "procedural"),
            MemoryType::Working => write!(f, "working"),
            MemoryType::Contextual => write!(f, "contextual"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            "procedural" => Ok(MemoryType::Procedural),
            "working" => Ok(MemoryType::Working),
            "contextual" => Ok(MemoryType::Contextual),
            _ => Err(Error::invalid_input(format!("Unknown memory type: {}", s))),
        }
    }
}

/// Synchronization status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written by a caller, not yet seen by a sync pass
    Pending,

    /// Promoted by a sync pass
    Synced,

    /// Held for manual review
    Conflict,

    /// Logically removed; terminal
    Deleted,
}

impl SyncStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// ```text
    /// pending ──→ synced | conflict | deleted
    /// synced  ──→ pending (re-write) | conflict (manual review) | deleted
    /// conflict ─→ synced (resolution) | deleted
    /// deleted    (terminal)
    /// ```
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Synced)
                | (Pending, Conflict)
                | (Pending, Deleted)
                | (Synced, Pending)
                | (Synced, Conflict)
                | (Synced, Deleted)
                | (Conflict, Synced)
                | (Conflict, Deleted)
        )
    }

    /// Whether the record still takes part in sync and queries
    pub fn is_live(self) -> bool {
        self != SyncStatus::Deleted
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Conflict => write!(f, "conflict"),
            SyncStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Stable identity of "the same fact" across copies: owner, user and content
/// fingerprint at first write. Shadow copies inherit the origin's key, so a
/// key never spans two users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginKey(String);

impl OriginKey {
    pub fn new(owner_agent_id: &str, user_id: &str, content_hash: &str) -> Self {
        let short = &content_hash[..content_hash.len().min(16)];
        Self(format!("{}:{}:{}", owner_agent_id, user_id, short))
    }

    /// The agent that first wrote the fact
    pub fn owner(&self) -> &str {
        self.0.split_once(':').map(|(owner, _)| owner).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OriginKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for OriginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// blake3 hex digest of the content
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// The parts of a record that decide whether two copies diverge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    content_hash: String,
    importance: u32,
    confidence: u32,
    tags: BTreeSet<String>,
    memory_type: MemoryType,
    category: String,
    session_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// A single memory owned by one agent for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique memory ID (assigned by the slice store when empty)
    #[serde(default)]
    pub memory_id: String,

    /// Agent whose slice holds this record
    pub owner_agent_id: String,

    /// User this memory is about
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub memory_type: MemoryType,

    /// Free-form classification used by sharing rules
    pub category: String,

    pub content: String,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    pub importance: f32,

    pub confidence: f32,

    #[serde(default)]
    pub version: u64,

    pub sync_status: SyncStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    /// Only meaningful for working memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Agents holding a shadow copy (filled from the store's origin index)
    #[serde(skip)]
    pub shared_with: BTreeSet<String>,

    /// Set only on shadow copies: the originating owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_key: Option<OriginKey>,

    /// Explicit targets requested by the writer, kept for every later propagation
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub share_requests: BTreeSet<String>,

    #[serde(default)]
    pub content_hash: String,

    /// Embedding vector (populated lazily for ranking)
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    /// Create a new pending episodic record
    pub fn new(
        owner_agent_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let content = content.into();
        Self {
            memory_id: String::new(),
            owner_agent_id: owner_agent_id.into(),
            user_id: user_id.into(),
            session_id: None,
            memory_type: MemoryType::Episodic,
            category: "general".to_string(),
            content_hash: content_hash(&content),
            content,
            tags: BTreeSet::new(),
            importance: 0.5,
            confidence: 1.0,
            version: 0,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
            shared_with: BTreeSet::new(),
            source_agent_id: None,
            origin_key: None,
            share_requests: BTreeSet::new(),
            embedding: None,
        }
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Pin the origin key, e.g. when importing a fact already known elsewhere
    pub fn with_origin_key(mut self, origin_key: OriginKey) -> Self {
        self.origin_key = Some(origin_key);
        self
    }

    pub fn with_share_requests<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.share_requests = agents.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the content and refresh its hash
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.content_hash = content_hash(&self.content);
        self.embedding = None;
    }

    /// Whether this is a derived copy of another agent's record
    pub fn is_shadow(&self) -> bool {
        self.source_agent_id.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.memory_type == MemoryType::Working
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            content_hash: self.content_hash.clone(),
            importance: self.importance.to_bits(),
            confidence: self.confidence.to_bits(),
            tags: self.tags.clone(),
            memory_type: self.memory_type,
            category: self.category.clone(),
            session_id: self.session_id.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Copy everything [`fingerprint`](Self::fingerprint) covers from `other`
    pub fn copy_payload_from(&mut self, other: &MemoryRecord) {
        self.content = other.content.clone();
        self.content_hash = other.content_hash.clone();
        self.tags = other.tags.clone();
        self.importance = other.importance;
        self.confidence = other.confidence;
        self.memory_type = other.memory_type;
        self.category = other.category.clone();
        self.session_id = other.session_id.clone();
        self.expires_at = other.expires_at;
        self.embedding = other.embedding.clone();
    }

    /// Materialize a shadow copy of this record in `target_agent`'s slice
    pub fn shadow_for(&self, target_agent: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            memory_id: Uuid::new_v4().to_string(),
            owner_agent_id: target_agent.to_string(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            memory_type: self.memory_type,
            category: self.category.clone(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            importance: self.importance,
            confidence: self.confidence,
            version: 1,
            sync_status: SyncStatus::Synced,
            created_at: now,
            updated_at: self.updated_at,
            last_accessed_at: now,
            expires_at: self.expires_at,
            shared_with: BTreeSet::new(),
            source_agent_id: Some(self.owner_agent_id.clone()),
            origin_key: self.origin_key.clone(),
            share_requests: BTreeSet::new(),
            content_hash: self.content_hash.clone(),
            embedding: self.embedding.clone(),
        }
    }

    /// Validate caller-supplied fields
    pub fn validate(&self) -> Result<()> {
        if self.owner_agent_id.trim().is_empty() {
            return Err(Error::invalid_input("owner_agent_id must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::invalid_input("user_id must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(Error::invalid_input(format!(
                "importance must be in [0, 1], got {}",
                self.importance
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::invalid_input(format!(
                "confidence must be in [0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }

    /// Rough storage footprint: payload plus a fixed overhead for metadata
    pub fn approximate_size(&self) -> usize {
        const METADATA_OVERHEAD: usize = 512;
        self.content.len()
            + self.category.len()
            + self.tags.iter().map(String::len).sum::<usize>()
            + METADATA_OVERHEAD
    }
}
