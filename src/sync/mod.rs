//! Sync engine
//!
//! One pass per agent walks **idle → collecting → resolving → applying →
//! propagating → idle**:
//!
//! - collecting: expire working memory, purge old deleted records, gather the
//!   agent's pending records (and synced ones on a forced pass)
//! - resolving: group records by origin key and run the conflict resolver on
//!   groups whose versions diverge
//! - applying: write resolutions back, each write under the record's lock
//! - propagating: create, refresh or retract shadow copies per the sharing rules
//!
//! [`scheduler`] drives passes on a fixed interval in a background task.

mod engine;
mod scheduler;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::LockStats;
use crate::slice::StoreStats;

pub use engine::{SyncEngine, SyncSettings};
pub use scheduler::{spawn_background_sync, SyncHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Collecting,
    Resolving,
    Applying,
    Propagating,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Collecting => write!(f, "collecting"),
            SyncPhase::Resolving => write!(f, "resolving"),
            SyncPhase::Applying => write!(f, "applying"),
            SyncPhase::Propagating => write!(f, "propagating"),
        }
    }
}

/// Outcome of one pass for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub operation_id: String,
    pub agent_id: String,
    pub force_sync: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub memories_processed: usize,
    pub promoted: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub conflicts_deferred: usize,
    /// Groups left alone because a manual review is open on them
    pub skipped_conflicts: usize,
    /// Records changed by someone else between planning and writing
    pub stale_skipped: usize,
    /// Independent duplicates deleted in favor of the resolved record
    pub superseded: usize,
    pub shadows_created: usize,
    pub shadows_refreshed: usize,
    pub shadows_retracted: usize,
    pub expired: usize,
    pub purged: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn new(agent_id: &str, force_sync: bool) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            force_sync,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of record writes the pass performed
    pub fn writes(&self) -> usize {
        self.promoted
            + self.conflicts_resolved
            + self.conflicts_deferred
            + self.superseded
            + self.shadows_created
            + self.shadows_refreshed
            + self.shadows_retracted
            + self.expired
            + self.purged
    }
}

/// Outcome of a pass over several agents
#[derive(Debug, Clone, Serialize)]
pub struct MultiSyncReport {
    pub coordination_id: String,
    pub force_sync: bool,
    pub agents_synced: Vec<String>,
    pub agent_results: BTreeMap<String, SyncReport>,
    /// Agents whose pass failed, with the error
    pub failures: BTreeMap<String, String>,
    pub total_memories_processed: usize,
    pub total_conflicts: usize,
    pub total_shadows_created: usize,
    pub duration_ms: u64,
}

impl MultiSyncReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.agent_results.values().all(SyncReport::success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperationType {
    Sync,
    ResolveConflict,
}

/// Audit entry for a sync pass or a manual resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: String,
    pub operation_type: SyncOperationType,
    pub agent_id: String,
    pub memory_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncOperation {
    pub fn start(operation_type: SyncOperationType, agent_id: &str) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            operation_type,
            agent_id: agent_id.to_string(),
            memory_ids: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            success: false,
            error_message: None,
        }
    }

    pub fn finish(mut self, error: Option<String>) -> Self {
        self.completed_at = Some(Utc::now());
        self.success = error.is_none();
        self.error_message = error;
        self
    }
}

/// Counters for sync activity since startup
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub total_syncs: AtomicU64,
    pub successful_syncs: AtomicU64,
    pub failed_syncs: AtomicU64,
    pub storage_errors: AtomicU64,
    pub records_promoted: AtomicU64,
    pub cross_agent_shares: AtomicU64,
    pub background_cycles: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let total_syncs = self.total_syncs.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        SyncMetricsSnapshot {
            total_syncs,
            successful_syncs: self.successful_syncs.load(Ordering::Relaxed),
            failed_syncs: self.failed_syncs.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            records_promoted: self.records_promoted.load(Ordering::Relaxed),
            cross_agent_shares: self.cross_agent_shares.load(Ordering::Relaxed),
            background_cycles: self.background_cycles.load(Ordering::Relaxed),
            average_pass_ms: if total_syncs == 0 {
                0.0
            } else {
                total_duration_ms as f64 / total_syncs as f64
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetricsSnapshot {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub storage_errors: u64,
    pub records_promoted: u64,
    pub cross_agent_shares: u64,
    pub background_cycles: u64,
    pub average_pass_ms: f64,
}

/// Everything `get_sync_statistics` reports
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub metrics: SyncMetricsSnapshot,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub pending_conflicts: usize,
    pub checkpoints: BTreeMap<String, DateTime<Utc>>,
    pub recent_operations: Vec<SyncOperation>,
    pub locks: LockStats,
    pub store: StoreStats,
}
