use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::agent::{Agent, AgentRegistry};
use crate::conflict::{self, Conflict, ConflictResolver, ConflictStrategy, ManualChoice, Resolution};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::memory::{MemoryRecord, OriginKey, SyncStatus};
use crate::sharing::{SharingRule, SharingRuleEngine};
use crate::slice::MemorySliceStore;
use crate::storage::JsonlLog;

use super::{
    MultiSyncReport, SyncMetrics, SyncOperation, SyncOperationType, SyncPhase, SyncReport,
    SyncStatistics,
};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Lifetime of the locks a pass takes while writing
    pub lock_duration: Duration,
    /// Operations kept in memory for statistics
    pub operation_history: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(300),
            operation_history: 1000,
        }
    }
}

/// Lock holder identity for an agent's sync pass. Distinct from the agent's
/// own identity so re-entrancy never lets a pass and a caller write together.
fn sync_holder(agent_id: &str) -> String {
    format!("sync:{}", agent_id)
}

/// What a pass decided to do with one origin group
enum GroupPlan {
    /// No divergence: promote the pending copies
    Promote {
        pending: Vec<MemoryRecord>,
        canonical: Vec<String>,
    },
    /// Apply `resolved` over `candidates`
    Resolve {
        conflict: Option<Conflict>,
        resolved: MemoryRecord,
        candidates: Vec<MemoryRecord>,
        group: Vec<MemoryRecord>,
    },
    /// Hold every candidate for manual review
    Defer {
        conflict: Conflict,
        candidates: Vec<MemoryRecord>,
    },
    /// Pending records arriving on a group already under review
    JoinReview {
        conflict: Conflict,
        pending: Vec<MemoryRecord>,
    },
}

/// How far a resolution got
enum Applied {
    /// A candidate changed after planning; nothing was decided
    Stale,
    /// The surviving canonical record
    Canonical(String),
    /// Every candidate was a shadow and now carries the resolved payload
    ShadowsOnly,
}

pub struct SyncEngine {
    registry: Arc<AgentRegistry>,
    store: Arc<MemorySliceStore>,
    locks: Arc<LockManager>,
    resolver: Arc<ConflictResolver>,
    sharing: RwLock<Arc<SharingRuleEngine>>,
    settings: SyncSettings,
    metrics: SyncMetrics,
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
    pass_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    history: Mutex<VecDeque<SyncOperation>>,
    audit: Option<JsonlLog<SyncOperation>>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<MemorySliceStore>,
        locks: Arc<LockManager>,
        resolver: Arc<ConflictResolver>,
        sharing: SharingRuleEngine,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            resolver,
            sharing: RwLock::new(Arc::new(sharing)),
            settings,
            metrics: SyncMetrics::new(),
            checkpoints: Mutex::new(HashMap::new()),
            pass_locks: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            audit: None,
        }
    }

    /// Append every operation to a JSONL audit log
    pub fn with_audit_log(mut self, log: JsonlLog<SyncOperation>) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// The rule set passes currently evaluate
    pub fn sharing(&self) -> Result<Arc<SharingRuleEngine>> {
        self.sharing
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|e| Error::storage(e.to_string()))
    }

    /// Swap the whole rule set. Existing shadows are re-evaluated by the next
    /// forced pass.
    pub fn reload_sharing_rules(&self, rules: Vec<SharingRule>) -> Result<()> {
        let compiled = SharingRuleEngine::new(rules)?;
        let count = compiled.rules().len();
        let mut sharing = self
            .sharing
            .write()
            .map_err(|e| Error::storage(e.to_string()))?;
        *sharing = Arc::new(compiled);
        tracing::info!(rules = count, "Reloaded sharing rules");
        Ok(())
    }

    pub fn checkpoint(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.checkpoints.lock().ok()?.get(agent_id).copied()
    }

    /// Most recent operations, newest last
    pub fn recent_operations(&self, limit: usize) -> Vec<SyncOperation> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> SyncStatistics {
        let checkpoints: BTreeMap<String, DateTime<Utc>> = self
            .checkpoints
            .lock()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();

        SyncStatistics {
            metrics: self.metrics.snapshot(),
            conflicts_detected: self.resolver.detected_count(),
            conflicts_resolved: self.resolver.resolved_count(),
            pending_conflicts: self.resolver.pending_count(),
            checkpoints,
            recent_operations: self.recent_operations(20),
            locks: self.locks.stats(),
            store: self.store.stats(),
        }
    }

    fn pass_lock(&self, agent_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut pass_locks = self
            .pass_locks
            .lock()
            .map_err(|e| Error::storage(e.to_string()))?;
        Ok(Arc::clone(pass_locks.entry(agent_id.to_string()).or_default()))
    }

    fn enter(&self, agent_id: &str, phase: SyncPhase) {
        tracing::debug!(agent_id = %agent_id, phase = %phase, "Sync phase");
    }

    fn record_operation(&self, operation: SyncOperation) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&operation) {
                tracing::warn!(error = %e, operation_id = %operation.operation_id, "Failed to append sync audit entry");
            }
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(operation);
            while history.len() > self.settings.operation_history {
                history.pop_front();
            }
        }
    }

    /// Run one pass for `agent_id` using its default conflict strategy
    pub async fn sync_agent_memories(&self, agent_id: &str, force_sync: bool) -> Result<SyncReport> {
        self.sync_agent_with(agent_id, force_sync, None).await
    }

    /// Run one pass for `agent_id`, optionally overriding the strategy used
    /// for conflicts detected during it
    pub async fn sync_agent_with(
        &self,
        agent_id: &str,
        force_sync: bool,
        strategy: Option<ConflictStrategy>,
    ) -> Result<SyncReport> {
        let agent = self.registry.ensure_active(agent_id)?;

        // One pass per agent at a time; the timer and on-demand calls queue here
        let pass_lock = self.pass_lock(agent_id)?;
        let _pass = pass_lock.lock().await;

        let started = Instant::now();
        let mut report = SyncReport::new(agent_id, force_sync);
        let mut operation = SyncOperation::start(SyncOperationType::Sync, agent_id);

        let outcome = self
            .run_pass(&agent, force_sync, strategy, &mut report, &mut operation.memory_ids)
            .await;
        self.enter(agent_id, SyncPhase::Idle);

        report.completed_at = Some(Utc::now());
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics.total_syncs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_duration_ms
            .fetch_add(report.duration_ms, Ordering::Relaxed);
        self.metrics
            .records_promoted
            .fetch_add(report.promoted as u64, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                self.metrics.successful_syncs.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut checkpoints) = self.checkpoints.lock() {
                    checkpoints.insert(agent_id.to_string(), Utc::now());
                }
                self.record_operation(operation.finish(report.errors.first().cloned()));

                if report.writes() > 0 || !report.errors.is_empty() {
                    tracing::info!(
                        agent_id = %agent_id,
                        processed = report.memories_processed,
                        promoted = report.promoted,
                        conflicts = report.conflicts_detected,
                        shadows_created = report.shadows_created,
                        errors = report.errors.len(),
                        duration_ms = report.duration_ms,
                        "Sync pass completed"
                    );
                } else {
                    tracing::trace!(agent_id = %agent_id, "Sync pass completed with nothing to do");
                }
                Ok(report)
            }
            Err(e) => {
                self.metrics.failed_syncs.fetch_add(1, Ordering::Relaxed);
                if e.is_storage() {
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                }
                tracing::error!(agent_id = %agent_id, error = %e, "Sync pass failed");
                self.record_operation(operation.finish(Some(e.to_string())));
                Err(e)
            }
        }
    }

    /// Run a pass for every active agent concurrently. A failing agent is
    /// reported without affecting the others.
    pub async fn sync_all_agents(&self, force_sync: bool) -> MultiSyncReport {
        let agents = self.registry.active();
        self.sync_agents(agents, force_sync).await
    }

    /// Background cycle: active agents that opted into automatic sync
    pub async fn background_pass(&self) -> MultiSyncReport {
        self.metrics.background_cycles.fetch_add(1, Ordering::Relaxed);
        self.locks.cleanup_expired();
        let agents = self
            .registry
            .list()
            .into_iter()
            .filter(|a| a.is_active() && a.config.auto_sync)
            .map(|a| a.config.agent_id)
            .collect();
        self.sync_agents(agents, false).await
    }

    async fn sync_agents(&self, agents: Vec<String>, force_sync: bool) -> MultiSyncReport {
        let started = Instant::now();
        let outcomes = join_all(
            agents
                .iter()
                .map(|agent_id| self.sync_agent_memories(agent_id, force_sync)),
        )
        .await;

        let mut report = MultiSyncReport {
            coordination_id: uuid::Uuid::new_v4().to_string(),
            force_sync,
            agents_synced: Vec::new(),
            agent_results: BTreeMap::new(),
            failures: BTreeMap::new(),
            total_memories_processed: 0,
            total_conflicts: 0,
            total_shadows_created: 0,
            duration_ms: 0,
        };
        for (agent_id, outcome) in agents.into_iter().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    report.total_memories_processed += result.memories_processed;
                    report.total_conflicts += result.conflicts_detected;
                    report.total_shadows_created += result.shadows_created;
                    report.agents_synced.push(agent_id.clone());
                    report.agent_results.insert(agent_id, result);
                }
                Err(e) => {
                    report.failures.insert(agent_id, e.to_string());
                }
            }
        }
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report
    }

    async fn run_pass(
        &self,
        agent: &Agent,
        force_sync: bool,
        strategy: Option<ConflictStrategy>,
        report: &mut SyncReport,
        touched_ids: &mut Vec<String>,
    ) -> Result<()> {
        let agent_id = agent.id();
        let holder = sync_holder(agent_id);

        self.enter(agent_id, SyncPhase::Collecting);
        let now = Utc::now();
        let registry = &self.registry;
        report.expired = self
            .store
            .expire_working_memory(now, |owner| {
                registry
                    .get(owner)
                    .ok()
                    .map(|a| a.config.max_working_memory_items)
            })?
            .len();
        report.purged = self
            .store
            .purge_deleted(agent_id, now - agent.config.retention())?;

        let collected = self.store.records_for_agent(agent_id, |r| match r.sync_status {
            SyncStatus::Pending => true,
            SyncStatus::Synced => force_sync,
            SyncStatus::Conflict | SyncStatus::Deleted => false,
        })?;
        report.memories_processed = collected.len();
        touched_ids.extend(collected.iter().map(|r| r.memory_id.clone()));
        let origins: BTreeSet<OriginKey> =
            collected.iter().filter_map(|r| r.origin_key.clone()).collect();

        self.enter(agent_id, SyncPhase::Resolving);
        let mut plans = Vec::with_capacity(origins.len());
        for origin in origins {
            plans.push(self.plan_group(agent, &origin, strategy)?);
        }

        self.enter(agent_id, SyncPhase::Applying);
        let mut to_propagate = BTreeSet::new();
        for plan in plans {
            match self.apply_plan(&holder, plan, report).await {
                Ok(ids) => to_propagate.extend(ids),
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Skipped origin group");
                    report.errors.push(e.to_string());
                }
            }
        }

        self.enter(agent_id, SyncPhase::Propagating);
        let sharing = self.sharing()?;
        for memory_id in to_propagate {
            match self.propagate(&holder, &memory_id, &sharing, report).await {
                Ok(()) => {}
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, memory_id = %memory_id, error = %e, "Propagation skipped");
                    report.errors.push(e.to_string());
                }
            }
        }

        Ok(())
    }

    fn plan_group(
        &self,
        agent: &Agent,
        origin: &OriginKey,
        strategy: Option<ConflictStrategy>,
    ) -> Result<GroupPlan> {
        let group: Vec<MemoryRecord> = self
            .store
            .records_in_origin(origin)?
            .into_iter()
            .filter(|r| matches!(r.sync_status, SyncStatus::Pending | SyncStatus::Synced))
            .collect();

        if let Some(conflict) = self.resolver.pending_for_origin(origin) {
            return Ok(GroupPlan::JoinReview {
                conflict,
                pending: group
                    .into_iter()
                    .filter(|r| r.sync_status == SyncStatus::Pending)
                    .collect(),
            });
        }

        let canonical: Vec<String> = group
            .iter()
            .filter(|r| !r.is_shadow())
            .map(|r| r.memory_id.clone())
            .collect();
        // Synced shadows mirror their source; only local edits compete
        let candidates: Vec<MemoryRecord> = group
            .iter()
            .filter(|r| !r.is_shadow() || r.sync_status == SyncStatus::Pending)
            .cloned()
            .collect();
        let distinct: HashSet<_> = candidates.iter().map(MemoryRecord::fingerprint).collect();

        if distinct.len() <= 1 && canonical.len() <= 1 {
            return Ok(GroupPlan::Promote {
                pending: group
                    .into_iter()
                    .filter(|r| r.sync_status == SyncStatus::Pending)
                    .collect(),
                canonical,
            });
        }

        let priority_of = |agent_id: &str| self.registry.priority_of(agent_id);

        if distinct.len() <= 1 {
            // Identical independent copies: keep one without opening a conflict
            let resolved = match conflict::resolve(&candidates, ConflictStrategy::LatestWins, priority_of)? {
                Resolution::Resolved(r) => r,
                Resolution::Deferred => return Err(Error::invalid_input("latest-wins never defers")),
            };
            return Ok(GroupPlan::Resolve {
                conflict: None,
                resolved,
                candidates,
                group,
            });
        }

        let strategy = strategy.unwrap_or(agent.config.default_strategy);
        let conflict = Conflict::new(origin.clone(), agent.id(), candidates.clone(), strategy);
        tracing::info!(
            agent_id = %agent.id(),
            conflict_id = %conflict.conflict_id,
            origin_key = %origin,
            candidates = candidates.len(),
            strategy = %strategy,
            "Conflict detected"
        );

        Ok(match conflict::resolve(&candidates, strategy, priority_of)? {
            Resolution::Resolved(resolved) => GroupPlan::Resolve {
                conflict: Some(conflict),
                resolved,
                candidates,
                group,
            },
            Resolution::Deferred => GroupPlan::Defer {
                conflict,
                candidates,
            },
        })
    }

    /// Execute a plan, returning the canonical records to propagate
    async fn apply_plan(&self, holder: &str, plan: GroupPlan, report: &mut SyncReport) -> Result<Vec<String>> {
        match plan {
            GroupPlan::Promote { pending, canonical } => {
                for record in pending {
                    let guard = self
                        .locks
                        .acquire_guard(&record.memory_id, holder, Some(self.settings.lock_duration), true)
                        .await?;
                    if !self.unchanged(&record)? {
                        report.stale_skipped += 1;
                        continue;
                    }
                    self.store
                        .set_status(&record.memory_id, SyncStatus::Synced, &guard)?;
                    report.promoted += 1;
                }
                Ok(canonical)
            }
            GroupPlan::Resolve {
                conflict,
                resolved,
                candidates,
                group,
            } => {
                report.conflicts_detected += usize::from(conflict.is_some());
                let applied = self
                    .apply_resolution(holder, &candidates, &group, &resolved, report)
                    .await?;
                let (settled, to_propagate) = match applied {
                    Applied::Stale => return Ok(Vec::new()),
                    Applied::Canonical(target) => (self.store.get(&target)?, vec![target]),
                    Applied::ShadowsOnly => (settled_payload(resolved), Vec::new()),
                };

                if let Some(mut conflict) = conflict {
                    let strategy = conflict.strategy_used;
                    conflict.resolve(settled, strategy);
                    self.resolver.record(conflict)?;
                    report.conflicts_resolved += 1;
                }
                Ok(to_propagate)
            }
            GroupPlan::Defer {
                conflict,
                candidates,
            } => {
                report.conflicts_detected += 1;
                let conflict = self.resolver.record(conflict)?;
                for record in candidates {
                    let guard = self
                        .locks
                        .acquire_guard(&record.memory_id, holder, Some(self.settings.lock_duration), true)
                        .await?;
                    if !self.unchanged(&record)? {
                        report.stale_skipped += 1;
                        continue;
                    }
                    self.store
                        .set_status(&record.memory_id, SyncStatus::Conflict, &guard)?;
                }
                report.conflicts_deferred += 1;
                tracing::warn!(conflict_id = %conflict.conflict_id, "Conflict held for manual review");
                Ok(Vec::new())
            }
            GroupPlan::JoinReview {
                mut conflict,
                pending,
            } => {
                report.skipped_conflicts += 1;
                if pending.is_empty() {
                    return Ok(Vec::new());
                }
                for record in pending {
                    let guard = self
                        .locks
                        .acquire_guard(&record.memory_id, holder, Some(self.settings.lock_duration), true)
                        .await?;
                    if !self.unchanged(&record)? {
                        report.stale_skipped += 1;
                        continue;
                    }
                    let held = self
                        .store
                        .set_status(&record.memory_id, SyncStatus::Conflict, &guard)?;
                    conflict
                        .candidate_versions
                        .retain(|c| c.memory_id != held.memory_id);
                    conflict.candidate_versions.push(held);
                }
                conflict
                    .candidate_versions
                    .sort_by(|a, b| a.memory_id.cmp(&b.memory_id));
                self.resolver.record(conflict)?;
                Ok(Vec::new())
            }
        }
    }

    /// Whether the stored record still matches the snapshot a plan was built from
    fn unchanged(&self, snapshot: &MemoryRecord) -> Result<bool> {
        let live = self.store.get(&snapshot.memory_id)?;
        Ok(live.version == snapshot.version && live.sync_status == snapshot.sync_status)
    }

    /// Make `resolved` the single authoritative version over `candidates`.
    ///
    /// The surviving canonical record takes the resolved payload, other
    /// canonical candidates are deleted, shadow candidates are overwritten and
    /// shadows derived from deleted candidates are retracted.
    async fn apply_resolution(
        &self,
        holder: &str,
        candidates: &[MemoryRecord],
        group: &[MemoryRecord],
        resolved: &MemoryRecord,
        report: &mut SyncReport,
    ) -> Result<Applied> {
        let lock_duration = Some(self.settings.lock_duration);
        let max_version = candidates.iter().map(|c| c.version).max().unwrap_or(0);
        let target = pick_target(candidates, resolved);

        let next_version = |record: &MemoryRecord| {
            if record.fingerprint() == resolved.fingerprint() {
                record.version
            } else {
                (max_version + 1).max(resolved.version).max(record.version + 1)
            }
        };

        if let Some(target) = target {
            let guard = self
                .locks
                .acquire_guard(&target.memory_id, holder, lock_duration, true)
                .await?;
            if !self.unchanged(target)? {
                report.stale_skipped += 1;
                return Ok(Applied::Stale);
            }
            self.store.apply_resolution(
                &target.memory_id,
                resolved,
                next_version(target),
                SyncStatus::Synced,
                &guard,
            )?;
        }

        let mut superseded_owners = BTreeSet::new();
        for candidate in candidates {
            if target.is_some_and(|t| t.memory_id == candidate.memory_id) {
                continue;
            }
            let guard = self
                .locks
                .acquire_guard(&candidate.memory_id, holder, lock_duration, true)
                .await?;
            if !self.unchanged(candidate)? {
                report.stale_skipped += 1;
                continue;
            }
            if candidate.is_shadow() {
                self.store.apply_resolution(
                    &candidate.memory_id,
                    resolved,
                    next_version(candidate),
                    SyncStatus::Synced,
                    &guard,
                )?;
                report.shadows_refreshed += 1;
            } else {
                self.store.mark_deleted(&candidate.memory_id, &guard)?;
                superseded_owners.insert(candidate.owner_agent_id.clone());
                report.superseded += 1;
            }
        }

        // Shadows fed by a deleted duplicate no longer have a live source
        if let Some(target) = target {
            superseded_owners.remove(&target.owner_agent_id);
        }
        for shadow in group {
            let orphaned = shadow.is_shadow()
                && shadow.sync_status == SyncStatus::Synced
                && shadow
                    .source_agent_id
                    .as_ref()
                    .is_some_and(|s| superseded_owners.contains(s))
                && !candidates.iter().any(|c| c.memory_id == shadow.memory_id);
            if !orphaned {
                continue;
            }
            let guard = self
                .locks
                .acquire_guard(&shadow.memory_id, holder, lock_duration, true)
                .await?;
            if self.unchanged(shadow)? {
                self.store.mark_deleted(&shadow.memory_id, &guard)?;
                report.shadows_retracted += 1;
            }
        }

        Ok(match target {
            Some(t) => Applied::Canonical(t.memory_id.clone()),
            None => Applied::ShadowsOnly,
        })
    }

    /// Bring every shadow of a canonical record in line with the sharing rules
    async fn propagate(
        &self,
        holder: &str,
        memory_id: &str,
        sharing: &SharingRuleEngine,
        report: &mut SyncReport,
    ) -> Result<()> {
        let lock_duration = Some(self.settings.lock_duration);
        // Held for the whole step so concurrent passes cannot both create a shadow
        let _origin_guard = self
            .locks
            .acquire_guard(memory_id, holder, lock_duration, true)
            .await?;

        let record = self.store.get(memory_id)?;
        if record.sync_status != SyncStatus::Synced || record.is_shadow() {
            return Ok(());
        }
        let Some(origin) = record.origin_key.clone() else {
            return Ok(());
        };

        // Inactive agents keep the copies they have but receive nothing new
        let allowed = sharing.resolve_targets(&record, &record.share_requests);
        let targets: BTreeSet<String> = allowed
            .iter()
            .filter(|agent_id| self.registry.is_active(agent_id))
            .cloned()
            .collect();

        for target in &targets {
            match self.store.shadow_of(&origin, target, &record.owner_agent_id)? {
                None => {
                    let shadow = self.store.insert_shadow(record.shadow_for(target))?;
                    report.shadows_created += 1;
                    self.metrics.cross_agent_shares.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        memory_id = %record.memory_id,
                        shadow_id = %shadow.memory_id,
                        source_agent_id = %record.owner_agent_id,
                        target_agent_id = %target,
                        "Shared memory"
                    );
                }
                Some(shadow) if shadow.sync_status != SyncStatus::Synced => {
                    // A local edit awaits the target's own pass
                    tracing::debug!(shadow_id = %shadow.memory_id, "Shadow has unsynced edits, not refreshed");
                }
                Some(shadow) if shadow.fingerprint() != record.fingerprint() => {
                    let guard = self
                        .locks
                        .acquire_guard(&shadow.memory_id, holder, lock_duration, true)
                        .await?;
                    if self.unchanged(&shadow)? {
                        self.store.apply_resolution(
                            &shadow.memory_id,
                            &record,
                            shadow.version + 1,
                            SyncStatus::Synced,
                            &guard,
                        )?;
                        report.shadows_refreshed += 1;
                    }
                }
                Some(_) => {}
            }
        }

        for shadow in self.store.records_in_origin(&origin)? {
            let retract = shadow.is_shadow()
                && shadow.sync_status.is_live()
                && shadow.source_agent_id.as_deref() == Some(record.owner_agent_id.as_str())
                && !allowed.contains(&shadow.owner_agent_id);
            if !retract {
                continue;
            }
            let guard = self
                .locks
                .acquire_guard(&shadow.memory_id, holder, lock_duration, true)
                .await?;
            self.store.mark_deleted(&shadow.memory_id, &guard)?;
            report.shadows_retracted += 1;
            let reason = if sharing.is_denied(&record, &shadow.owner_agent_id) {
                "denied"
            } else {
                "no longer targeted"
            };
            tracing::info!(
                shadow_id = %shadow.memory_id,
                agent_id = %shadow.owner_agent_id,
                reason,
                "Retracted shadow"
            );
        }

        Ok(())
    }

    /// Apply an operator's answer to a manual-review conflict
    pub async fn resolve_conflict(&self, conflict_id: &str, choice: ManualChoice) -> Result<Conflict> {
        let mut conflict = self.resolver.get(conflict_id)?;
        if !conflict.is_pending() {
            return Err(Error::invalid_input(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        let holder = format!("resolve:{}", conflict.conflict_id);
        let mut operation = SyncOperation::start(SyncOperationType::ResolveConflict, &conflict.detected_by);
        operation.memory_ids = conflict.candidate_ids();

        let outcome = self.apply_manual_choice(&holder, &mut conflict, choice).await;
        match outcome {
            Ok(()) => {
                self.record_operation(operation.finish(None));
                tracing::info!(
                    conflict_id = %conflict.conflict_id,
                    strategy = %conflict.strategy_used,
                    "Conflict resolved"
                );
                Ok(conflict)
            }
            Err(e) => {
                if e.is_storage() {
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.record_operation(operation.finish(Some(e.to_string())));
                Err(e)
            }
        }
    }

    async fn apply_manual_choice(
        &self,
        holder: &str,
        conflict: &mut Conflict,
        choice: ManualChoice,
    ) -> Result<()> {
        let current: Vec<MemoryRecord> = conflict
            .candidate_ids()
            .iter()
            .filter_map(|id| self.store.get(id).ok())
            .filter(|r| r.sync_status.is_live())
            .collect();
        if current.is_empty() {
            return Err(Error::not_found(format!(
                "live candidates of conflict {}",
                conflict.conflict_id
            )));
        }

        let priority_of = |agent_id: &str| self.registry.priority_of(agent_id);
        let (resolved, strategy) = match choice {
            ManualChoice::Strategy(ConflictStrategy::ManualReview) => {
                return Err(Error::invalid_input("manual-review cannot resolve a conflict"))
            }
            ManualChoice::Strategy(strategy) => match conflict::resolve(&current, strategy, priority_of)? {
                Resolution::Resolved(r) => (r, strategy),
                Resolution::Deferred => return Err(Error::invalid_input("strategy deferred again")),
            },
            ManualChoice::Candidate(memory_id) => {
                let chosen = current
                    .iter()
                    .find(|c| c.memory_id == memory_id)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("candidate {}", memory_id)))?;
                (chosen, ConflictStrategy::ManualReview)
            }
            ManualChoice::Content(content) => {
                let mut edited = match conflict::resolve(&current, ConflictStrategy::LatestWins, priority_of)? {
                    Resolution::Resolved(r) => r,
                    Resolution::Deferred => return Err(Error::invalid_input("latest-wins never defers")),
                };
                edited.set_content(content);
                edited.version = current.iter().map(|c| c.version).max().unwrap_or(0) + 1;
                edited.updated_at = Utc::now();
                (edited, ConflictStrategy::ManualReview)
            }
        };

        let group: Vec<MemoryRecord> = self
            .store
            .records_in_origin(&conflict.origin_key)?
            .into_iter()
            .filter(|r| r.sync_status.is_live())
            .collect();

        let mut report = SyncReport::new(&conflict.detected_by, false);
        let applied = self
            .apply_resolution(holder, &current, &group, &resolved, &mut report)
            .await?;
        let target = match applied {
            Applied::Stale => {
                return Err(Error::conflict_pending(format!(
                    "candidates of conflict {} changed during resolution",
                    conflict.conflict_id
                )))
            }
            Applied::Canonical(target) => target,
            Applied::ShadowsOnly => {
                conflict.resolve(settled_payload(resolved), strategy);
                *conflict = self.resolver.record(conflict.clone())?;
                return Ok(());
            }
        };

        conflict.resolve(self.store.get(&target)?, strategy);
        *conflict = self.resolver.record(conflict.clone())?;

        let sharing = self.sharing()?;
        self.propagate(holder, &target, &sharing, &mut report).await?;
        Ok(())
    }
}

/// The resolved payload as it now stands in the store
fn settled_payload(mut resolved: MemoryRecord) -> MemoryRecord {
    resolved.sync_status = SyncStatus::Synced;
    resolved
}

/// Canonical candidate that survives a resolution: the winner itself when
/// canonical, else the origin owner's record, else the oldest. `None` when
/// every candidate is a shadow.
fn pick_target<'a>(candidates: &'a [MemoryRecord], resolved: &MemoryRecord) -> Option<&'a MemoryRecord> {
    let canonical: Vec<&MemoryRecord> = candidates.iter().filter(|c| !c.is_shadow()).collect();
    if let Some(winner) = canonical.iter().find(|c| c.memory_id == resolved.memory_id) {
        return Some(*winner);
    }
    let origin_owner = resolved.origin_key.as_ref().map(|k| k.owner().to_string());
    if let Some(owned) = canonical
        .iter()
        .find(|c| Some(&c.owner_agent_id) == origin_owner.as_ref())
    {
        return Some(*owned);
    }
    canonical
        .into_iter()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.memory_id.cmp(&b.memory_id)))
}
