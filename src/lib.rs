//! # Dieah Sync
//!
//! Memory synchronization and coordination for Dieah's cooperating agents.
//!
//! ## Architecture
//!
//! Each agent owns a private slice of memories per user. The engine keeps
//! those slices consistent while sharing selected memories between agents:
//! - **Agent Registry** - who participates, with priority and conflict strategy
//! - **Memory Slice Store** - records partitioned by agent then user, indexed by origin
//! - **Lock Manager** - per-record exclusive locks with TTL and bounded waits
//! - **Sharing Rules** - global-allow, restricted-deny and auto-propagate rules
//! - **Conflict Resolver** - deterministic strategies plus a manual review queue
//! - **Sync Engine** - per-agent passes that promote, resolve and propagate
//! - **Coordinator** - the facade callers use
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dieah_sync::{Config, Coordinator, NewMemory};
//!
//! let coordinator = Coordinator::open(Config::load()?)?;
//!
//! // Write into alden's slice; stays pending until alden syncs
//! let id = coordinator
//!     .store_agent_memory("alden", "user-1", NewMemory::new("Prefers dark mode").category("preference"))
//!     .await?;
//!
//! // Promote and share it per the sharing rules
//! coordinator.sync_agent_memories("alden", false).await?;
//!
//! // alice now finds it among her shared memories
//! let results = coordinator
//!     .search_agent_memories("alice", "user-1", "dark mode", true)
//!     .await?;
//! ```

pub mod agent;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod lock;
pub mod memory;
pub mod retrieval;
pub mod sharing;
pub mod slice;
pub mod storage;
pub mod sync;

pub use agent::{Agent, AgentConfig, AgentPriority, AgentRegistry, AgentStatus};
pub use config::Config;
pub use conflict::{Conflict, ConflictResolver, ConflictStrategy, ManualChoice, Resolution};
pub use coordinator::{Coordinator, CoordinatorStatus, MemoryAllocation, MemorySlice, MemoryUpdate, NewMemory};
pub use error::{Error, ErrorKind, Result};
pub use lock::{LockGuard, LockManager, LockToken};
pub use memory::{MemoryRecord, MemoryType, OriginKey, SyncStatus};
pub use retrieval::{RetrievalEngine, SearchResults};
pub use sharing::{RuleTrigger, SharingMode, SharingRule, SharingRuleEngine};
pub use slice::{MemorySliceStore, QueryFilter};
pub use sync::{MultiSyncReport, SyncEngine, SyncHandle, SyncReport, SyncStatistics};
