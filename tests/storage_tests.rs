//! Persistence and storage-failure behavior

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dieah_sync::{
    embedding::HashingEmbedder,
    storage::{InMemoryKv, JsonlLog, KvStore},
    sync::SyncOperation,
    Config, Coordinator, Error, ErrorKind, NewMemory, SyncStatus,
};

/// Wraps a store and fails every write while `failing` is set
struct FlakyKv {
    inner: InMemoryKv,
    failing: AtomicBool,
}

impl FlakyKv {
    fn new() -> Self {
        Self {
            inner: InMemoryKv::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> dieah_sync::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::storage("disk unavailable"));
        }
        Ok(())
    }
}

impl KvStore for FlakyKv {
    fn get(&self, key: &str) -> dieah_sync::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> dieah_sync::Result<()> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> dieah_sync::Result<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> dieah_sync::Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }
}

fn flaky_coordinator() -> (Arc<FlakyKv>, Coordinator) {
    let kv = Arc::new(FlakyKv::new());
    let config = Config::default();
    let embedder = Arc::new(HashingEmbedder::new(config.embedding_dimensions));
    let coordinator = Coordinator::new(config, kv.clone(), embedder).unwrap();
    coordinator.register_configured_agents().unwrap();
    (kv, coordinator)
}

#[tokio::test]
async fn storage_failure_is_isolated_and_counted() {
    let (kv, c) = flaky_coordinator();
    let alden = c
        .store_agent_memory("alden", "u1", NewMemory::new("likes jazz"))
        .await
        .unwrap();
    c.store_agent_memory("alice", "u1", NewMemory::new("works late"))
        .await
        .unwrap();

    kv.set_failing(true);

    let err = c
        .store_agent_memory("alden", "u1", NewMemory::new("never stored"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

    let report = c.sync_all_agents(false).await;
    assert!(report.failures.contains_key("alden"));
    assert!(report.failures.contains_key("alice"));
    // Nothing to write, so unaffected
    assert!(report.agent_results.contains_key("sentry"));

    let status = c.get_coordinator_status().unwrap();
    assert_eq!(status.storage_errors, 2);
    assert_eq!(status.failed_syncs, 2);
    assert_eq!(
        c.store().get(&alden).unwrap().sync_status,
        SyncStatus::Pending
    );

    // The next cycle picks the work up once storage is back
    kv.set_failing(false);
    let report = c.sync_all_agents(false).await;
    assert!(report.success());
    assert_eq!(c.store().get(&alden).unwrap().sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_data_dir(dir.path());

    let memory_id = {
        let c = Coordinator::open(config.clone()).unwrap();
        let id = c
            .store_agent_memory(
                "alden",
                "u1",
                NewMemory::new("Prefers window seats").category("preference"),
            )
            .await
            .unwrap();
        c.sync_agent_memories("alden", false).await.unwrap();
        c.deregister_agent("mimic").unwrap();
        id
    };

    let c = Coordinator::open(config.clone()).unwrap();
    assert_eq!(c.register_configured_agents().unwrap(), 0);
    assert!(!c.get_agent("mimic").unwrap().is_active());

    let record = c.get_agent_memory("alden", &memory_id).unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.content, "Prefers window seats");
    assert!(record.shared_with.contains("alice"));

    // A second pass over reloaded state changes nothing
    let report = c.sync_agent_memories("alden", true).await.unwrap();
    assert_eq!(report.writes(), 0);

    let log: JsonlLog<SyncOperation> = JsonlLog::new(config.operation_log_path()).unwrap();
    let entries = log.read_all().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.success));
}

#[tokio::test]
async fn deleted_records_are_purged_after_retention() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(dir.path());
    config.agents.retain(|a| a.agent_id == "alden");
    config.agents[0].retention_days = 0;

    let c = Coordinator::open(config).unwrap();
    let id = c
        .store_agent_memory("alden", "u1", NewMemory::new("temporary"))
        .await
        .unwrap();
    c.delete_agent_memory("alden", &id).await.unwrap();
    assert!(c.store().contains(&id));
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let report = c.sync_agent_memories("alden", false).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(!c.store().contains(&id));
}
