//! Memory slice store
//!
//! Owns every memory record, partitioned by agent then user, together with
//! the origin index that links shadow copies to the fact they came from.
//! Each mutation is written to the key/value store first and applied to the
//! in-memory state only once that write succeeded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};
use crate::memory::{MemoryRecord, MemoryType, OriginKey, SyncStatus};
use crate::storage::{self, KvStore, MEMORY_PREFIX};

/// Filters for [`MemorySliceStore::query`]
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub memory_type: Option<MemoryType>,
    pub category: Option<String>,
    /// Every listed tag must be present
    pub tags: BTreeSet<String>,
    pub session_id: Option<String>,
    /// Inclusive lower bound on `updated_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `updated_at`
    pub until: Option<DateTime<Utc>>,
    pub include_shared: bool,
    pub include_deleted: bool,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
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

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn include_shared(mut self, include: bool) -> Self {
        self.include_shared = include;
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.include_deleted && record.sync_status == SyncStatus::Deleted {
            return false;
        }
        if !self.include_shared && record.is_shadow() {
            return false;
        }
        if self.memory_type.is_some_and(|t| t != record.memory_type) {
            return false;
        }
        if self.category.as_ref().is_some_and(|c| c != &record.category) {
            return false;
        }
        if self
            .session_id
            .as_ref()
            .is_some_and(|s| record.session_id.as_ref() != Some(s))
        {
            return false;
        }
        if self.since.is_some_and(|since| record.updated_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.updated_at >= until) {
            return false;
        }
        self.tags.is_subset(&record.tags)
    }
}

/// Counts over the whole store
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub live_records: usize,
    pub shadow_records: usize,
    pub origin_groups: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Default)]
struct SliceState {
    records: HashMap<String, MemoryRecord>,
    /// agent -> user -> memory ids
    partitions: HashMap<String, HashMap<String, BTreeSet<String>>>,
    origins: HashMap<OriginKey, BTreeSet<String>>,
    origin_of: HashMap<String, OriginKey>,
}

impl SliceState {
    fn index(&mut self, record: &MemoryRecord) {
        self.partitions
            .entry(record.owner_agent_id.clone())
            .or_default()
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.memory_id.clone());

        if let Some(origin) = &record.origin_key {
            self.origins
                .entry(origin.clone())
                .or_default()
                .insert(record.memory_id.clone());
            self.origin_of
                .insert(record.memory_id.clone(), origin.clone());
        }
    }

    fn unindex(&mut self, record: &MemoryRecord) {
        if let Some(users) = self.partitions.get_mut(&record.owner_agent_id) {
            if let Some(ids) = users.get_mut(&record.user_id) {
                ids.remove(&record.memory_id);
                if ids.is_empty() {
                    users.remove(&record.user_id);
                }
            }
        }
        if let Some(origin) = self.origin_of.remove(&record.memory_id) {
            if let Some(ids) = self.origins.get_mut(&origin) {
                ids.remove(&record.memory_id);
                if ids.is_empty() {
                    self.origins.remove(&origin);
                }
            }
        }
    }

    /// Owners of live shadow copies derived from `record`
    fn shared_with(&self, record: &MemoryRecord) -> BTreeSet<String> {
        if record.is_shadow() {
            return BTreeSet::new();
        }
        let Some(origin) = &record.origin_key else {
            return BTreeSet::new();
        };
        self.origins
            .get(origin)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .filter(|r| {
                r.sync_status.is_live()
                    && r.source_agent_id.as_deref() == Some(record.owner_agent_id.as_str())
            })
            .map(|r| r.owner_agent_id.clone())
            .collect()
    }

    fn hydrated(&self, record: &MemoryRecord) -> MemoryRecord {
        let mut out = record.clone();
        out.shared_with = self.shared_with(record);
        out
    }

    fn ids_for_agent(&self, agent_id: &str) -> Vec<String> {
        self.partitions
            .get(agent_id)
            .into_iter()
            .flat_map(|users| users.values().flatten().cloned())
            .collect()
    }
}

pub struct MemorySliceStore {
    kv: Arc<dyn KvStore>,
    locks: Arc<LockManager>,
    state: RwLock<SliceState>,
}

impl MemorySliceStore {
    /// Open the store, rebuilding records and indexes from `kv`
    pub fn open(kv: Arc<dyn KvStore>, locks: Arc<LockManager>) -> Result<Self> {
        let records: Vec<MemoryRecord> = storage::scan_json(kv.as_ref(), MEMORY_PREFIX)?;

        let mut state = SliceState::default();
        for record in records {
            state.index(&record);
            state.records.insert(record.memory_id.clone(), record);
        }
        tracing::info!(
            records = state.records.len(),
            origins = state.origins.len(),
            "Loaded memory slices"
        );

        Ok(Self {
            kv,
            locks,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SliceState>> {
        self.state.read().map_err(|e| Error::storage(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SliceState>> {
        self.state.write().map_err(|e| Error::storage(e.to_string()))
    }

    fn persist(&self, record: &MemoryRecord) -> Result<()> {
        storage::put_json(
            self.kv.as_ref(),
            &format!("{}{}", MEMORY_PREFIX, record.memory_id),
            record,
        )
    }

    /// Persist `record`, then swap it into the in-memory state
    fn commit(&self, state: &mut SliceState, record: MemoryRecord) -> Result<MemoryRecord> {
        self.persist(&record)?;
        if let Some(previous) = state.records.remove(&record.memory_id) {
            state.unindex(&previous);
        }
        state.index(&record);
        let hydrated = state.hydrated(&record);
        state.records.insert(record.memory_id.clone(), record);
        Ok(hydrated)
    }

    fn check_guard(&self, memory_id: &str, guard: &LockGuard) -> Result<()> {
        if guard.memory_id() != memory_id {
            return Err(Error::InvalidToken(memory_id.to_string()));
        }
        self.locks.validate(memory_id, guard.token())
    }

    /// Store `record`: a new id is inserted, an existing one updated under `lock`
    pub fn put(&self, record: MemoryRecord, lock: Option<&LockGuard>) -> Result<MemoryRecord> {
        let exists =
            !record.memory_id.is_empty() && self.read()?.records.contains_key(&record.memory_id);

        match (exists, lock) {
            (false, _) => self.insert(record),
            (true, Some(guard)) => self.update(record, guard),
            (true, None) => Err(Error::InvalidToken(record.memory_id)),
        }
    }

    /// Insert a new caller-written record as `pending`, version 1
    pub fn insert(&self, mut record: MemoryRecord) -> Result<MemoryRecord> {
        record.validate()?;
        if record.memory_id.is_empty() {
            record.memory_id = Uuid::new_v4().to_string();
        }

        let now = Utc::now();
        let embedding = record.embedding.take();
        let content = std::mem::take(&mut record.content);
        record.set_content(content);
        record.embedding = embedding;
        record.version = 1;
        record.sync_status = SyncStatus::Pending;
        record.created_at = now;
        record.updated_at = now;
        record.last_accessed_at = now;
        record.shared_with.clear();
        if record.origin_key.is_none() {
            record.origin_key = Some(OriginKey::new(
                &record.owner_agent_id,
                &record.user_id,
                &record.content_hash,
            ));
        }

        let mut state = self.write()?;
        if state.records.contains_key(&record.memory_id) {
            return Err(Error::invalid_input(format!(
                "memory {} already exists",
                record.memory_id
            )));
        }
        let stored = self.commit(&mut state, record)?;

        tracing::debug!(
            memory_id = %stored.memory_id,
            agent_id = %stored.owner_agent_id,
            user_id = %stored.user_id,
            "Stored memory"
        );
        Ok(stored)
    }

    /// Insert a shadow copy produced by propagation
    pub fn insert_shadow(&self, shadow: MemoryRecord) -> Result<MemoryRecord> {
        if !shadow.is_shadow() || shadow.origin_key.is_none() {
            return Err(Error::invalid_input("shadow copies need a source and an origin key"));
        }
        let mut state = self.write()?;
        if state.records.contains_key(&shadow.memory_id) {
            return Err(Error::invalid_input(format!(
                "memory {} already exists",
                shadow.memory_id
            )));
        }
        self.commit(&mut state, shadow)
    }

    /// Replace the caller-editable fields of an existing record.
    ///
    /// Owner, origin and creation time are kept; the version is bumped and
    /// the record goes back to `pending`.
    pub fn update(&self, record: MemoryRecord, lock: &LockGuard) -> Result<MemoryRecord> {
        record.validate()?;
        self.check_guard(&record.memory_id, lock)?;

        let mut state = self.write()?;
        let existing = state
            .records
            .get(&record.memory_id)
            .ok_or_else(|| Error::not_found(format!("memory {}", record.memory_id)))?;

        match existing.sync_status {
            SyncStatus::Conflict => {
                return Err(Error::conflict_pending(format!(
                    "memory {} awaits conflict resolution",
                    record.memory_id
                )))
            }
            SyncStatus::Deleted => {
                return Err(Error::invalid_input(format!(
                    "memory {} is deleted",
                    record.memory_id
                )))
            }
            SyncStatus::Pending | SyncStatus::Synced => {}
        }
        if existing.owner_agent_id != record.owner_agent_id {
            return Err(Error::invalid_input("the owner of a memory cannot change"));
        }

        let mut updated = existing.clone();
        if updated.content_hash != crate::memory::content_hash(&record.content) {
            updated.set_content(record.content.clone());
        }
        updated.memory_type = record.memory_type;
        updated.category = record.category.clone();
        updated.tags = record.tags.clone();
        updated.importance = record.importance;
        updated.confidence = record.confidence;
        updated.session_id = record.session_id.clone();
        updated.expires_at = record.expires_at;
        updated.share_requests = record.share_requests.clone();
        updated.version += 1;
        updated.sync_status = SyncStatus::Pending;
        updated.updated_at = Utc::now();

        self.commit(&mut state, updated)
    }

    pub fn get(&self, memory_id: &str) -> Result<MemoryRecord> {
        let state = self.read()?;
        state
            .records
            .get(memory_id)
            .map(|r| state.hydrated(r))
            .ok_or_else(|| Error::not_found(format!("memory {}", memory_id)))
    }

    pub fn contains(&self, memory_id: &str) -> bool {
        self.read()
            .map(|s| s.records.contains_key(memory_id))
            .unwrap_or(false)
    }

    /// Records in one agent's slice for one user, ordered by importance then
    /// recency of access
    pub fn query(&self, agent_id: &str, user_id: &str, filter: &QueryFilter) -> Result<Vec<MemoryRecord>> {
        let state = self.read()?;
        let mut results: Vec<MemoryRecord> = state
            .partitions
            .get(agent_id)
            .and_then(|users| users.get(user_id))
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id))
            .filter(|r| filter.matches(r))
            .map(|r| state.hydrated(r))
            .collect();

        results.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then(b.last_accessed_at.cmp(&a.last_accessed_at))
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        Ok(results)
    }

    /// Every record owned by `agent_id` (all users) accepted by `keep`
    pub fn records_for_agent<F>(&self, agent_id: &str, keep: F) -> Result<Vec<MemoryRecord>>
    where
        F: Fn(&MemoryRecord) -> bool,
    {
        let state = self.read()?;
        let mut records: Vec<MemoryRecord> = state
            .ids_for_agent(agent_id)
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| keep(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.memory_id.cmp(&b.memory_id));
        Ok(records)
    }

    /// Every record about `user_id`, across agents
    pub fn records_for_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let state = self.read()?;
        Ok(state
            .partitions
            .values()
            .filter_map(|users| users.get(user_id))
            .flatten()
            .filter_map(|id| state.records.get(id))
            .cloned()
            .collect())
    }

    /// All records sharing `origin_key`, ordered by memory id
    pub fn records_in_origin(&self, origin_key: &OriginKey) -> Result<Vec<MemoryRecord>> {
        let state = self.read()?;
        Ok(state
            .origins
            .get(origin_key)
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id))
            .map(|r| state.hydrated(r))
            .collect())
    }

    /// The live shadow of `source_agent`'s fact held by `target_agent`
    pub fn shadow_of(
        &self,
        origin_key: &OriginKey,
        target_agent: &str,
        source_agent: &str,
    ) -> Result<Option<MemoryRecord>> {
        Ok(self.records_in_origin(origin_key)?.into_iter().find(|r| {
            r.owner_agent_id == target_agent
                && r.sync_status.is_live()
                && r.source_agent_id.as_deref() == Some(source_agent)
        }))
    }

    pub fn shared_with(&self, memory_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.get(memory_id)?.shared_with)
    }

    fn locked_mutation<F>(&self, memory_id: &str, guard: &LockGuard, mutate: F) -> Result<MemoryRecord>
    where
        F: FnOnce(&mut MemoryRecord) -> Result<()>,
    {
        self.check_guard(memory_id, guard)?;
        let mut state = self.write()?;
        let mut record = state
            .records
            .get(memory_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("memory {}", memory_id)))?;
        mutate(&mut record)?;
        self.commit(&mut state, record)
    }

    fn transition(record: &mut MemoryRecord, status: SyncStatus) -> Result<()> {
        if record.sync_status == status {
            return Ok(());
        }
        if !record.sync_status.can_transition_to(status) {
            return Err(Error::invalid_input(format!(
                "memory {} cannot move from {} to {}",
                record.memory_id, record.sync_status, status
            )));
        }
        record.sync_status = status;
        Ok(())
    }

    /// Move a record to `status` without touching its payload
    pub fn set_status(&self, memory_id: &str, status: SyncStatus, guard: &LockGuard) -> Result<MemoryRecord> {
        self.locked_mutation(memory_id, guard, |record| Self::transition(record, status))
    }

    /// Overwrite the payload with `payload`'s and set the version and status
    pub fn apply_resolution(
        &self,
        memory_id: &str,
        payload: &MemoryRecord,
        version: u64,
        status: SyncStatus,
        guard: &LockGuard,
    ) -> Result<MemoryRecord> {
        self.locked_mutation(memory_id, guard, |record| {
            if version < record.version {
                return Err(Error::invalid_input(format!(
                    "memory {} version cannot go back from {} to {}",
                    memory_id, record.version, version
                )));
            }
            Self::transition(record, status)?;
            if record.fingerprint() != payload.fingerprint() {
                record.copy_payload_from(payload);
                record.updated_at = payload.updated_at.max(record.updated_at);
            }
            record.version = version;
            Ok(())
        })
    }

    pub fn mark_deleted(&self, memory_id: &str, guard: &LockGuard) -> Result<MemoryRecord> {
        self.locked_mutation(memory_id, guard, |record| {
            Self::transition(record, SyncStatus::Deleted)?;
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Mark working memory past its expiry as deleted, then enforce each
    /// agent's working-memory cap per user (oldest first). Locked records are
    /// left for a later pass. Returns the ids that were expired.
    pub fn expire_working_memory<F>(&self, now: DateTime<Utc>, cap_for: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> Option<usize>,
    {
        let mut state = self.write()?;

        let mut doomed: BTreeSet<String> = BTreeSet::new();
        let mut live_by_slice: HashMap<(String, String), Vec<&MemoryRecord>> = HashMap::new();
        for record in state.records.values() {
            if record.memory_type != MemoryType::Working || !record.sync_status.is_live() {
                continue;
            }
            if record.is_expired(now) {
                doomed.insert(record.memory_id.clone());
            } else {
                live_by_slice
                    .entry((record.owner_agent_id.clone(), record.user_id.clone()))
                    .or_default()
                    .push(record);
            }
        }
        for ((agent_id, _), mut records) in live_by_slice {
            let Some(cap) = cap_for(&agent_id) else {
                continue;
            };
            if records.len() <= cap {
                continue;
            }
            records.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.memory_id.cmp(&b.memory_id))
            });
            let excess = records.len() - cap;
            doomed.extend(records.iter().take(excess).map(|r| r.memory_id.clone()));
        }

        let mut expired = Vec::new();
        for memory_id in doomed {
            if self.locks.is_locked(&memory_id) {
                continue;
            }
            let Some(mut record) = state.records.get(&memory_id).cloned() else {
                continue;
            };
            record.sync_status = SyncStatus::Deleted;
            record.updated_at = now;
            self.commit(&mut state, record)?;
            expired.push(memory_id);
        }

        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), "Expired working memory");
        }
        Ok(expired)
    }

    /// Remove `agent_id`'s deleted records last touched before `cutoff`
    pub fn purge_deleted(&self, agent_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write()?;
        let doomed: Vec<String> = state
            .ids_for_agent(agent_id)
            .into_iter()
            .filter(|id| {
                state.records.get(id).is_some_and(|r| {
                    r.sync_status == SyncStatus::Deleted && r.updated_at < cutoff
                })
            })
            .collect();

        for memory_id in &doomed {
            self.kv.delete(&format!("{}{}", MEMORY_PREFIX, memory_id))?;
            if let Some(record) = state.records.remove(memory_id) {
                state.unindex(&record);
            }
        }

        if !doomed.is_empty() {
            tracing::info!(agent_id = %agent_id, purged = doomed.len(), "Purged deleted memories");
        }
        Ok(doomed.len())
    }

    /// Record an access. Only the timestamp changes, so no lock is needed.
    pub fn touch(&self, memory_ids: &[String], now: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        for memory_id in memory_ids {
            let Some(mut record) = state.records.get(memory_id).cloned() else {
                continue;
            };
            record.last_accessed_at = now;
            self.commit(&mut state, record)?;
        }
        Ok(())
    }

    /// Cache an embedding on the in-memory copy; embeddings are never persisted
    pub fn cache_embedding(&self, memory_id: &str, embedding: Vec<f32>) {
        if let Ok(mut state) = self.state.write() {
            if let Some(record) = state.records.get_mut(memory_id) {
                record.embedding = Some(embedding);
            }
        }
    }

    /// Agents with at least one record
    pub fn agent_ids(&self) -> Vec<String> {
        let Ok(state) = self.read() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = state.partitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> StoreStats {
        let Ok(state) = self.read() else {
            return StoreStats::default();
        };
        let mut stats = StoreStats {
            total_records: state.records.len(),
            origin_groups: state.origins.len(),
            ..Default::default()
        };
        for record in state.records.values() {
            if record.sync_status.is_live() {
                stats.live_records += 1;
                if record.is_shadow() {
                    stats.shadow_records += 1;
                }
            }
            *stats
                .by_status
                .entry(record.sync_status.to_string())
                .or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::storage::InMemoryKv;

    fn store() -> (Arc<dyn KvStore>, Arc<LockManager>, MemorySliceStore) {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let locks = Arc::new(LockManager::new(Duration::from_secs(60), Duration::from_secs(1)));
        let store = MemorySliceStore::open(kv.clone(), locks.clone()).unwrap();
        (kv, locks, store)
    }

    #[test]
    fn insert_assigns_identity_and_origin() {
        let (_, _, store) = store();
        let stored = store
            .put(MemoryRecord::new("alden", "u1", "dark mode"), None)
            .unwrap();

        assert!(!stored.memory_id.is_empty());
        assert_eq!(stored.version, 1);
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.origin_key.as_ref().unwrap().owner(), "alden");
        assert_eq!(stored.content_hash, crate::memory::content_hash("dark mode"));
        assert_eq!(store.get(&stored.memory_id).unwrap().content, "dark mode");
        assert!(matches!(store.get("nope").unwrap_err(), Error::NotFound(_)));

        // Same words about another user are a different fact
        let other_user = store
            .insert(MemoryRecord::new("alden", "u2", "dark mode"))
            .unwrap();
        assert_ne!(other_user.origin_key, stored.origin_key);
        assert_eq!(
            store
                .records_in_origin(stored.origin_key.as_ref().unwrap())
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn update_requires_live_lock() {
        let (_, locks, store) = store();
        let stored = store.insert(MemoryRecord::new("alden", "u1", "v1")).unwrap();

        let mut edited = stored.clone();
        edited.set_content("v2");
        assert!(matches!(
            store.put(edited.clone(), None).unwrap_err(),
            Error::InvalidToken(_)
        ));

        let other = locks.acquire_guard("elsewhere", "alden", None, false).await.unwrap();
        assert!(store.update(edited.clone(), &other).is_err());

        let guard = locks
            .acquire_guard(&stored.memory_id, "alden", None, false)
            .await
            .unwrap();
        let updated = store.put(edited, Some(&guard)).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.content, "v2");
        assert_eq!(updated.origin_key, stored.origin_key);
    }

    #[tokio::test]
    async fn conflicted_record_rejects_updates() {
        let (_, locks, store) = store();
        let stored = store.insert(MemoryRecord::new("alden", "u1", "x")).unwrap();
        let guard = locks
            .acquire_guard(&stored.memory_id, "sync:alden", None, false)
            .await
            .unwrap();
        store
            .set_status(&stored.memory_id, SyncStatus::Conflict, &guard)
            .unwrap();

        let err = store.update(stored.clone(), &guard).unwrap_err();
        assert!(matches!(err, Error::ConflictPending(_)));

        store.mark_deleted(&stored.memory_id, &guard).unwrap();
        assert!(store
            .set_status(&stored.memory_id, SyncStatus::Pending, &guard)
            .is_err());
    }

    #[test]
    fn query_filters_and_orders() {
        let (_, _, store) = store();
        store
            .insert(MemoryRecord::new("alden", "u1", "low").with_importance(0.2).with_tags(["a"]))
            .unwrap();
        store
            .insert(
                MemoryRecord::new("alden", "u1", "high")
                    .with_importance(0.9)
                    .with_tags(["a", "b"])
                    .with_category("preference"),
            )
            .unwrap();
        store.insert(MemoryRecord::new("alden", "u2", "other user")).unwrap();
        store.insert(MemoryRecord::new("alice", "u1", "other agent")).unwrap();

        let all = store.query("alden", "u1", &QueryFilter::new()).unwrap();
        assert_eq!(
            all.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["high", "low"]
        );

        let tagged = store
            .query("alden", "u1", &QueryFilter::new().tags(["a", "b"]))
            .unwrap();
        assert_eq!(tagged.len(), 1);

        let category = store
            .query("alden", "u1", &QueryFilter::new().category("general"))
            .unwrap();
        assert_eq!(category[0].content, "low");

        let future = store
            .query(
                "alden",
                "u1",
                &QueryFilter::new().between(Some(Utc::now() + chrono::Duration::hours(1)), None),
            )
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn shadows_are_indexed_by_origin() {
        let (_, _, store) = store();
        let origin = store
            .insert(MemoryRecord::new("alden", "u1", "dark mode").with_category("preference"))
            .unwrap();
        let shadow = store.insert_shadow(origin.shadow_for("alice")).unwrap();

        let key = origin.origin_key.clone().unwrap();
        assert_eq!(store.records_in_origin(&key).unwrap().len(), 2);
        assert_eq!(
            store.shared_with(&origin.memory_id).unwrap(),
            ["alice".to_string()].into()
        );
        assert_eq!(
            store.shadow_of(&key, "alice", "alden").unwrap().unwrap().memory_id,
            shadow.memory_id
        );

        let own_only = store.query("alice", "u1", &QueryFilter::new()).unwrap();
        assert!(own_only.is_empty());
        let with_shared = store
            .query("alice", "u1", &QueryFilter::new().include_shared(true))
            .unwrap();
        assert_eq!(with_shared.len(), 1);
    }

    #[tokio::test]
    async fn working_memory_expiry_and_cap() {
        let (_, locks, store) = store();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let future = Utc::now() + chrono::Duration::hours(1);

        let expired = store
            .insert(
                MemoryRecord::new("alden", "u1", "scratch")
                    .with_type(MemoryType::Working)
                    .with_expiry(past),
            )
            .unwrap();
        let locked = store
            .insert(
                MemoryRecord::new("alden", "u1", "busy scratch")
                    .with_type(MemoryType::Working)
                    .with_expiry(past),
            )
            .unwrap();
        let _guard = locks
            .acquire_guard(&locked.memory_id, "alden", None, false)
            .await
            .unwrap();
        for i in 0..3 {
            store
                .insert(
                    MemoryRecord::new("alice", "u1", format!("note {}", i))
                        .with_type(MemoryType::Working)
                        .with_expiry(future),
                )
                .unwrap();
        }

        let cap = |agent: &str| (agent == "alice").then_some(2);
        let removed = store.expire_working_memory(Utc::now(), cap).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&expired.memory_id));
        assert!(!removed.contains(&locked.memory_id));

        let visible = store
            .query("alden", "u1", &QueryFilter::new().memory_type(MemoryType::Working))
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(store.query("alice", "u1", &QueryFilter::new()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_old_deleted_records_from_kv() {
        let (kv, locks, store) = store();
        let stored = store.insert(MemoryRecord::new("mimic", "u1", "gone")).unwrap();
        let guard = locks
            .acquire_guard(&stored.memory_id, "mimic", None, false)
            .await
            .unwrap();
        store.mark_deleted(&stored.memory_id, &guard).unwrap();

        assert_eq!(store.purge_deleted("mimic", Utc::now() - chrono::Duration::days(1)).unwrap(), 0);
        assert_eq!(store.purge_deleted("mimic", Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(!store.contains(&stored.memory_id));
        assert!(kv.scan_prefix(MEMORY_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn reopen_rebuilds_indexes() {
        let (kv, locks, store) = store();
        let origin = store.insert(MemoryRecord::new("alden", "u1", "fact")).unwrap();
        store.insert_shadow(origin.shadow_for("mimic")).unwrap();

        let reopened = MemorySliceStore::open(kv, locks).unwrap();
        assert_eq!(reopened.stats().shadow_records, 1);
        assert_eq!(
            reopened.shared_with(&origin.memory_id).unwrap(),
            ["mimic".to_string()].into()
        );
    }
}
