//! Coordinator facade
//!
//! Composes the registry, slice store, lock manager, sharing rules, conflict
//! resolver and sync engine behind the operations callers use. Errors from
//! the components pass through unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentConfig, AgentPriority, AgentRegistry, AgentStatus};
use crate::config::Config;
use crate::conflict::{Conflict, ConflictResolver, ManualChoice};
use crate::embedding::{Embedder, HashingEmbedder};
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};
use crate::memory::{MemoryRecord, MemoryType, SyncStatus};
use crate::retrieval::{RetrievalEngine, SearchResults};
use crate::sharing::{SharingRule, SharingRuleEngine};
use crate::slice::{MemorySliceStore, QueryFilter};
use crate::storage::{InMemoryKv, JsonlLog, KvStore, SqliteKv};
use crate::sync::{
    spawn_background_sync, MultiSyncReport, SyncEngine, SyncHandle, SyncReport, SyncSettings,
    SyncStatistics,
};

/// A memory as written by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_memory_type")]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Agents to share with in addition to the sharing rules
    #[serde(default)]
    pub share_with: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_importance() -> f32 {
    0.5
}

fn default_confidence() -> f32 {
    1.0
}

fn default_memory_type() -> MemoryType {
    MemoryType::Episodic
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: default_category(),
            tags: Vec::new(),
            importance: default_importance(),
            confidence: default_confidence(),
            memory_type: default_memory_type(),
            session_id: None,
            expires_at: None,
            share_with: Vec::new(),
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn share_with<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.share_with = agents.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update of an existing memory; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub share_with: Option<Vec<String>>,
}

impl MemoryUpdate {
    fn apply(self, record: &mut MemoryRecord) {
        if let Some(content) = self.content {
            record.content = content;
        }
        if let Some(category) = self.category {
            record.category = category;
        }
        if let Some(tags) = self.tags {
            record.tags = tags.into_iter().collect();
        }
        if let Some(importance) = self.importance {
            record.importance = importance;
        }
        if let Some(confidence) = self.confidence {
            record.confidence = confidence;
        }
        if let Some(memory_type) = self.memory_type {
            record.memory_type = memory_type;
        }
        if let Some(share_with) = self.share_with {
            record.share_requests = share_with.into_iter().collect();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SliceStatistics {
    pub total: usize,
    pub own: usize,
    pub shared: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
}

/// One agent's view of one user's memories
#[derive(Debug, Clone, Serialize)]
pub struct MemorySlice {
    pub agent_id: String,
    pub user_id: String,
    pub memories: Vec<MemoryRecord>,
    pub statistics: SliceStatistics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentAllocation {
    pub records: usize,
    pub shadows: usize,
    pub approximate_bytes: usize,
}

/// Where a user's memories live across agents
#[derive(Debug, Clone, Serialize)]
pub struct MemoryAllocation {
    pub user_id: String,
    pub total_records: usize,
    pub agents: BTreeMap<String, AgentAllocation>,
    pub by_type: BTreeMap<String, usize>,
    pub storage_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub name: String,
    pub status: AgentStatus,
    pub priority: AgentPriority,
    pub live_records: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active_agents: usize,
    pub total_agents: usize,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub pending_conflicts: usize,
    pub cross_agent_shares: u64,
    pub storage_errors: u64,
    pub active_locks: usize,
    pub coordinated_operations: u64,
    pub agents: Vec<AgentSummary>,
}

pub struct Coordinator {
    config: Config,
    registry: Arc<AgentRegistry>,
    store: Arc<MemorySliceStore>,
    locks: Arc<LockManager>,
    resolver: Arc<ConflictResolver>,
    engine: Arc<SyncEngine>,
    retrieval: RetrievalEngine,
    coordinated_operations: AtomicU64,
}

impl Coordinator {
    /// Assemble a coordinator over `kv`. Configured agents are not registered;
    /// call [`Coordinator::register_configured_agents`] for that.
    pub fn new(config: Config, kv: Arc<dyn KvStore>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::build(config, kv, embedder, None)
    }

    /// Open the on-disk deployment under `config.data_dir`: SQLite records,
    /// a JSONL audit log and the configured agents
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::new(&config)?);
        let audit = JsonlLog::new(config.operation_log_path())?;
        let embedder = default_embedder(&config)?;

        let coordinator = Self::build(config, kv, embedder, Some(audit))?;
        coordinator.register_configured_agents()?;
        Ok(coordinator)
    }

    /// An ephemeral coordinator with the configured agents registered
    pub fn in_memory(config: Config) -> Result<Self> {
        let embedder = Arc::new(HashingEmbedder::new(config.embedding_dimensions));
        let coordinator = Self::build(config, Arc::new(InMemoryKv::new()), embedder, None)?;
        coordinator.register_configured_agents()?;
        Ok(coordinator)
    }

    fn build(
        config: Config,
        kv: Arc<dyn KvStore>,
        embedder: Arc<dyn Embedder>,
        audit: Option<JsonlLog<crate::sync::SyncOperation>>,
    ) -> Result<Self> {
        config.validate()?;

        let locks = Arc::new(LockManager::new(config.lock_duration(), config.lock_wait_timeout()));
        let registry = Arc::new(AgentRegistry::open(Arc::clone(&kv))?);
        let store = Arc::new(MemorySliceStore::open(Arc::clone(&kv), Arc::clone(&locks))?);
        let resolver = Arc::new(ConflictResolver::open(kv)?);
        let sharing = SharingRuleEngine::new(config.sharing_rules.clone())?;

        let mut engine = SyncEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&resolver),
            sharing,
            SyncSettings {
                lock_duration: config.lock_duration(),
                operation_history: config.operation_history,
            },
        );
        if let Some(audit) = audit {
            engine = engine.with_audit_log(audit);
        }

        let retrieval = RetrievalEngine::new(
            embedder,
            config.max_search_results,
            config.min_similarity_score,
        );

        Ok(Self {
            config,
            registry,
            store,
            locks,
            resolver,
            engine: Arc::new(engine),
            retrieval,
            coordinated_operations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemorySliceStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    fn count_operation(&self) {
        self.coordinated_operations.fetch_add(1, Ordering::Relaxed);
    }

    // --- Agents ---

    pub fn register_agent(&self, config: AgentConfig) -> Result<Agent> {
        let agent = self.registry.register(config)?;
        self.count_operation();
        Ok(agent)
    }

    /// Register every configured agent that is not already known. Returns the
    /// number registered.
    pub fn register_configured_agents(&self) -> Result<usize> {
        let mut registered = 0;
        for agent in &self.config.agents {
            if self.registry.get(&agent.agent_id).is_ok() {
                continue;
            }
            self.registry.register(agent.clone())?;
            registered += 1;
        }
        Ok(registered)
    }

    pub fn deregister_agent(&self, agent_id: &str) -> Result<Agent> {
        let agent = self.registry.deregister(agent_id)?;
        self.count_operation();
        Ok(agent)
    }

    /// Move an agent between active, maintenance and error. Anything but
    /// `active` takes it out of sync passes and caller writes.
    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<Agent> {
        let agent = self.registry.update_status(agent_id, status)?;
        self.count_operation();
        Ok(agent)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.registry.get(agent_id)
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.registry.list()
    }

    // --- Memories ---

    /// Write a new memory into `agent_id`'s slice. It stays `pending` until
    /// the agent's next sync pass.
    pub async fn store_agent_memory(
        &self,
        agent_id: &str,
        user_id: &str,
        memory: NewMemory,
    ) -> Result<String> {
        self.registry.ensure_active(agent_id)?;

        let mut record = MemoryRecord::new(agent_id, user_id, memory.content)
            .with_type(memory.memory_type)
            .with_category(memory.category)
            .with_tags(memory.tags)
            .with_importance(memory.importance)
            .with_confidence(memory.confidence)
            .with_share_requests(memory.share_with);
        if let Some(session_id) = memory.session_id {
            record = record.with_session(session_id);
        }
        match (memory.expires_at, memory.memory_type) {
            (Some(expires_at), _) => record = record.with_expiry(expires_at),
            (None, MemoryType::Working) => {
                record = record.with_expiry(Utc::now() + self.config.working_memory_ttl());
            }
            (None, _) => {}
        }
        record.validate()?;

        // Ranking falls back to embedding lazily at search time
        match self.retrieval.embedder().embed(&record.content).await {
            Ok(vector) => record.embedding = Some(vector),
            Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "Failed to embed memory"),
        }

        let stored = self.store.insert(record)?;
        self.count_operation();
        tracing::info!(
            agent_id = %agent_id,
            memory_id = %stored.memory_id,
            category = %stored.category,
            memory_type = %stored.memory_type,
            "Stored memory"
        );
        Ok(stored.memory_id)
    }

    fn owned_record(&self, agent_id: &str, memory_id: &str) -> Result<MemoryRecord> {
        let record = self.store.get(memory_id)?;
        if record.owner_agent_id != agent_id {
            return Err(Error::not_found(format!(
                "memory {} in slice of {}",
                memory_id, agent_id
            )));
        }
        Ok(record)
    }

    /// Lock a memory for exclusive writing. With `wait=false` a held lock
    /// fails fast with `ResourceBusy`.
    pub async fn lock_memory(
        &self,
        agent_id: &str,
        memory_id: &str,
        duration: Option<Duration>,
        wait: bool,
    ) -> Result<LockGuard> {
        self.registry.ensure_active(agent_id)?;
        self.store.get(memory_id)?;
        self.locks.acquire_guard(memory_id, agent_id, duration, wait).await
    }

    /// Edit a memory in the agent's own slice. Waits (bounded) for the
    /// record's lock.
    pub async fn update_agent_memory(
        &self,
        agent_id: &str,
        memory_id: &str,
        update: MemoryUpdate,
    ) -> Result<MemoryRecord> {
        self.registry.ensure_active(agent_id)?;
        self.owned_record(agent_id, memory_id)?;

        let guard = self.locks.acquire_guard(memory_id, agent_id, None, true).await?;
        // Re-read under the lock
        let mut record = self.owned_record(agent_id, memory_id)?;
        let content_changed = update.content.as_ref().is_some_and(|c| c != &record.content);
        update.apply(&mut record);

        let mut updated = self.store.update(record, &guard)?;
        guard.release()?;

        if content_changed {
            match self.retrieval.embedder().embed(&updated.content).await {
                Ok(vector) => {
                    self.store.cache_embedding(&updated.memory_id, vector.clone());
                    updated.embedding = Some(vector);
                }
                Err(e) => tracing::warn!(memory_id = %memory_id, error = %e, "Failed to embed memory"),
            }
        }

        self.count_operation();
        tracing::info!(agent_id = %agent_id, memory_id = %memory_id, version = updated.version, "Updated memory");
        Ok(updated)
    }

    /// Delete a memory from the agent's slice. Shadows other agents hold of
    /// it are retracted with it.
    pub async fn delete_agent_memory(&self, agent_id: &str, memory_id: &str) -> Result<()> {
        self.registry.ensure_active(agent_id)?;
        self.owned_record(agent_id, memory_id)?;

        let guard = self.locks.acquire_guard(memory_id, agent_id, None, true).await?;
        let record = self.owned_record(agent_id, memory_id)?;
        if record.sync_status == SyncStatus::Conflict {
            return Err(Error::conflict_pending(format!(
                "memory {} awaits conflict resolution",
                memory_id
            )));
        }
        self.store.mark_deleted(memory_id, &guard)?;
        guard.release()?;

        let mut retracted = 0;
        if let (false, Some(origin)) = (record.is_shadow(), record.origin_key.as_ref()) {
            for shadow in self.store.records_in_origin(origin)? {
                let derived = shadow.is_shadow()
                    && shadow.sync_status.is_live()
                    && shadow.source_agent_id.as_deref() == Some(agent_id);
                if !derived {
                    continue;
                }
                let guard = self
                    .locks
                    .acquire_guard(&shadow.memory_id, agent_id, None, true)
                    .await?;
                // A held shadow is released by its conflict's resolution
                if self.store.get(&shadow.memory_id)?.sync_status != SyncStatus::Conflict {
                    self.store.mark_deleted(&shadow.memory_id, &guard)?;
                    retracted += 1;
                }
            }
        }

        self.count_operation();
        tracing::info!(agent_id = %agent_id, memory_id = %memory_id, retracted, "Deleted memory");
        Ok(())
    }

    /// Fetch one memory from the agent's slice, recording the access
    pub fn get_agent_memory(&self, agent_id: &str, memory_id: &str) -> Result<MemoryRecord> {
        self.registry.get(agent_id)?;
        let mut record = self.owned_record(agent_id, memory_id)?;
        if !record.sync_status.is_live() {
            return Err(Error::not_found(format!("memory {}", memory_id)));
        }
        let now = Utc::now();
        self.store.touch(std::slice::from_ref(&record.memory_id), now)?;
        record.last_accessed_at = now;
        Ok(record)
    }

    /// Rank the agent's memories about `user_id` against `query`. Shadows
    /// shared into the slice are included when `include_shared` is set.
    pub async fn search_agent_memories(
        &self,
        agent_id: &str,
        user_id: &str,
        query: &str,
        include_shared: bool,
    ) -> Result<SearchResults> {
        self.registry.get(agent_id)?;

        let candidates = self.store.query(
            agent_id,
            user_id,
            &QueryFilter::new().include_shared(include_shared),
        )?;
        let sharing = self.engine.sharing()?;
        let results = self
            .retrieval
            .rank(query, candidates, &self.store, &sharing)
            .await?;
        self.store.touch(&results.memory_ids(), Utc::now())?;

        self.count_operation();
        tracing::debug!(
            agent_id = %agent_id,
            user_id = %user_id,
            results = results.len(),
            "Searched memories"
        );
        Ok(results)
    }

    pub fn get_agent_memory_slice(
        &self,
        agent_id: &str,
        user_id: &str,
        filter: &QueryFilter,
    ) -> Result<MemorySlice> {
        self.registry.get(agent_id)?;
        let memories = self.store.query(agent_id, user_id, filter)?;

        let mut statistics = SliceStatistics {
            total: memories.len(),
            ..Default::default()
        };
        for record in &memories {
            if record.is_shadow() {
                statistics.shared += 1;
            } else {
                statistics.own += 1;
            }
            *statistics
                .by_type
                .entry(record.memory_type.to_string())
                .or_default() += 1;
            *statistics
                .by_status
                .entry(record.sync_status.to_string())
                .or_default() += 1;
        }

        Ok(MemorySlice {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            memories,
            statistics,
        })
    }

    // --- Sync and conflicts ---

    pub async fn sync_agent_memories(&self, agent_id: &str, force_sync: bool) -> Result<SyncReport> {
        let report = self.engine.sync_agent_memories(agent_id, force_sync).await?;
        self.count_operation();
        Ok(report)
    }

    pub async fn sync_all_agents(&self, force_sync: bool) -> MultiSyncReport {
        let report = self.engine.sync_all_agents(force_sync).await;
        self.count_operation();
        report
    }

    pub async fn resolve_conflict(&self, conflict_id: &str, choice: ManualChoice) -> Result<Conflict> {
        let conflict = self.engine.resolve_conflict(conflict_id, choice).await?;
        self.count_operation();
        Ok(conflict)
    }

    /// Conflicts newest first; only those awaiting review when `pending_only`
    pub fn list_conflicts(&self, pending_only: bool) -> Vec<Conflict> {
        if pending_only {
            self.resolver.pending()
        } else {
            self.resolver.list()
        }
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Result<Conflict> {
        self.resolver.get(conflict_id)
    }

    pub fn reload_sharing_rules(&self, rules: Vec<SharingRule>) -> Result<()> {
        self.engine.reload_sharing_rules(rules)?;
        self.count_operation();
        Ok(())
    }

    pub fn sharing_rules(&self) -> Result<Vec<SharingRule>> {
        Ok(self.engine.sharing()?.rules())
    }

    /// Start the timer-driven sync task at the configured interval
    pub fn start_background_sync(&self) -> SyncHandle {
        spawn_background_sync(Arc::clone(&self.engine), self.config.sync_interval())
    }

    // --- Reporting ---

    pub fn get_memory_allocation(&self, user_id: &str) -> Result<MemoryAllocation> {
        let records: Vec<MemoryRecord> = self
            .store
            .records_for_user(user_id)?
            .into_iter()
            .filter(|r| r.sync_status.is_live())
            .collect();

        let mut agents: BTreeMap<String, AgentAllocation> = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_bytes = 0usize;
        for record in &records {
            let size = record.approximate_size();
            let allocation = agents.entry(record.owner_agent_id.clone()).or_default();
            allocation.records += 1;
            if record.is_shadow() {
                allocation.shadows += 1;
            }
            allocation.approximate_bytes += size;
            total_bytes += size;
            *by_type.entry(record.memory_type.to_string()).or_default() += 1;
        }

        Ok(MemoryAllocation {
            user_id: user_id.to_string(),
            total_records: records.len(),
            agents,
            by_type,
            storage_mb: total_bytes as f64 / (1024.0 * 1024.0),
        })
    }

    pub fn get_coordinator_status(&self) -> Result<CoordinatorStatus> {
        let metrics = self.engine.metrics().snapshot();
        let agents = self.registry.list();

        let mut summaries = Vec::with_capacity(agents.len());
        for agent in &agents {
            let live_records = self
                .store
                .records_for_agent(agent.id(), |r| r.sync_status.is_live())?
                .len();
            summaries.push(AgentSummary {
                agent_id: agent.id().to_string(),
                name: agent.config.name.clone(),
                status: agent.status,
                priority: agent.priority(),
                live_records,
                last_sync: self.engine.checkpoint(agent.id()),
            });
        }

        Ok(CoordinatorStatus {
            active_agents: agents.iter().filter(|a| a.is_active()).count(),
            total_agents: agents.len(),
            total_syncs: metrics.total_syncs,
            successful_syncs: metrics.successful_syncs,
            failed_syncs: metrics.failed_syncs,
            pending_conflicts: self.resolver.pending_count(),
            cross_agent_shares: metrics.cross_agent_shares,
            storage_errors: metrics.storage_errors,
            active_locks: self.locks.stats().active,
            coordinated_operations: self.coordinated_operations.load(Ordering::Relaxed),
            agents: summaries,
        })
    }

    pub fn get_sync_statistics(&self) -> SyncStatistics {
        self.engine.statistics()
    }

    /// Agents whose slices hold a record for `user_id`
    pub fn agents_for_user(&self, user_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .records_for_user(user_id)?
            .into_iter()
            .filter(|r| r.sync_status.is_live())
            .map(|r| r.owner_agent_id)
            .collect())
    }
}

#[cfg(not(feature = "fastembed"))]
fn default_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(HashingEmbedder::new(config.embedding_dimensions)))
}

#[cfg(feature = "fastembed")]
fn default_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(crate::embedding::FastEmbedder::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::in_memory(Config::default()).unwrap()
    }

    #[tokio::test]
    async fn configured_agents_are_registered_once() {
        let c = coordinator();
        assert_eq!(c.list_agents().len(), 4);
        assert_eq!(c.register_configured_agents().unwrap(), 0);
        assert!(matches!(
            c.register_agent(AgentConfig::new("alden")),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn store_rejects_unknown_and_inactive_agents() {
        let c = coordinator();
        let err = c
            .store_agent_memory("ghost", "u1", NewMemory::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        c.deregister_agent("mimic").unwrap();
        let err = c
            .store_agent_memory("mimic", "u1", NewMemory::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentInactive(_)));

        let err = c
            .store_agent_memory("alden", "u1", NewMemory::new("x").importance(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn maintenance_pauses_an_agent_until_reactivated() {
        let c = coordinator();
        let agent = c.set_agent_status("sentry", AgentStatus::Maintenance).unwrap();
        assert!(!agent.is_active());

        let err = c.sync_agent_memories("sentry", false).await.unwrap_err();
        assert!(matches!(err, Error::AgentInactive(_)));

        c.set_agent_status("sentry", AgentStatus::Active).unwrap();
        assert!(c.sync_agent_memories("sentry", false).await.is_ok());
    }

    #[tokio::test]
    async fn working_memory_gets_default_expiry() {
        let c = coordinator();
        let id = c
            .store_agent_memory(
                "alden",
                "u1",
                NewMemory::new("current task").memory_type(MemoryType::Working),
            )
            .await
            .unwrap();
        let record = c.get_agent_memory("alden", &id).unwrap();
        let ttl = record.expires_at.unwrap() - record.created_at;
        assert!(ttl <= c.config().working_memory_ttl());
        assert!(ttl > c.config().working_memory_ttl() - chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn update_and_delete_respect_ownership() {
        let c = coordinator();
        let id = c
            .store_agent_memory("alden", "u1", NewMemory::new("likes tea").category("preference"))
            .await
            .unwrap();

        let err = c
            .update_agent_memory("alice", &id, MemoryUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let updated = c
            .update_agent_memory(
                "alden",
                &id,
                MemoryUpdate {
                    content: Some("likes green tea".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync_status, SyncStatus::Pending);
        assert!(!c.locks().is_locked(&id));

        c.sync_agent_memories("alden", false).await.unwrap();
        assert_eq!(c.agents_for_user("u1").unwrap().len(), 3);

        c.delete_agent_memory("alden", &id).await.unwrap();
        assert!(c.get_agent_memory("alden", &id).is_err());
        assert!(c.agents_for_user("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_lock_fails_fast() {
        let c = coordinator();
        let id = c
            .store_agent_memory("alden", "u1", NewMemory::new("note"))
            .await
            .unwrap();

        let _guard = c.lock_memory("alden", &id, None, false).await.unwrap();
        let started = std::time::Instant::now();
        let err = c.lock_memory("alice", &id, None, false).await.unwrap_err();
        assert!(matches!(err, Error::ResourceBusy { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn slice_and_allocation_report_counts() {
        let c = coordinator();
        c.store_agent_memory("alden", "u1", NewMemory::new("likes jazz").category("preference"))
            .await
            .unwrap();
        c.store_agent_memory(
            "alden",
            "u1",
            NewMemory::new("drafting email").memory_type(MemoryType::Working),
        )
        .await
        .unwrap();
        c.sync_agent_memories("alden", false).await.unwrap();

        let slice = c
            .get_agent_memory_slice("alden", "u1", &QueryFilter::new())
            .unwrap();
        assert_eq!(slice.statistics.total, 2);
        assert_eq!(slice.statistics.by_status.get("synced"), Some(&2));

        let shared = c
            .get_agent_memory_slice("alice", "u1", &QueryFilter::new().include_shared(true))
            .unwrap();
        assert_eq!(shared.statistics.shared, 1);

        let allocation = c.get_memory_allocation("u1").unwrap();
        assert_eq!(allocation.total_records, 4);
        assert_eq!(allocation.agents["alden"].records, 2);
        assert_eq!(allocation.agents["alice"].shadows, 1);
        assert!(allocation.storage_mb > 0.0);

        let status = c.get_coordinator_status().unwrap();
        assert_eq!(status.total_agents, 4);
        assert_eq!(status.active_agents, 4);
        assert_eq!(status.total_syncs, 1);
        assert_eq!(status.cross_agent_shares, 2);
        assert!(status.coordinated_operations >= 3);
    }
}
