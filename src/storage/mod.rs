//! Storage backends for dieah-sync
//!
//! The coordination engine treats persistence as an opaque key/value
//! collaborator: one key per memory record (`memory:<id>`), per agent
//! (`agent:<id>`) and per conflict (`conflict:<id>`). Encryption at rest is
//! the backend's concern.

mod jsonl;
mod memory;
mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use jsonl::JsonlLog;
pub use memory::InMemoryKv;
pub use sqlite::SqliteKv;

/// Key prefix for memory records
pub const MEMORY_PREFIX: &str = "memory:";
/// Key prefix for registered agents
pub const AGENT_PREFIX: &str = "agent:";
/// Key prefix for conflicts
pub const CONFLICT_PREFIX: &str = "conflict:";

/// Persistent key/value store, atomic per key
pub trait KvStore: Send + Sync {
    /// Fetch the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Serialize `value` as JSON and store it under `key`
pub fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// Load and deserialize the JSON value under `key`
pub fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    store
        .get(key)?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
        .transpose()
}

/// Load every JSON value under `prefix`
pub fn scan_json<T: DeserializeOwned>(store: &dyn KvStore, prefix: &str) -> Result<Vec<T>> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Into::into))
        .collect()
}
