//! Per-record exclusive locks
//!
//! An in-process lock table keyed by memory id. Waiters park on a
//! [`Notify`] and wake on release or at the holder's expiry, whichever comes
//! first, bounded by the configured wait timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque proof of lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a live lock
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub memory_id: String,
    pub holder_agent_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: LockToken,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LockStats {
    pub active: usize,
    pub acquired: u64,
    pub released: u64,
    pub expired: u64,
}

struct LockEntry {
    info: LockInfo,
    deadline: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

enum Attempt {
    Granted(LockToken),
    Busy { holder: String, deadline: Instant },
}

pub struct LockManager {
    locks: Mutex<HashMap<String, LockEntry>>,
    released: Notify,
    default_duration: Duration,
    wait_timeout: Duration,
    acquired_count: AtomicU64,
    released_count: AtomicU64,
    expired_count: AtomicU64,
}

impl LockManager {
    pub fn new(default_duration: Duration, wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Notify::new(),
            default_duration,
            wait_timeout,
            acquired_count: AtomicU64::new(0),
            released_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    fn attempt(&self, memory_id: &str, agent_id: &str, duration: Duration) -> Result<Attempt> {
        let mut locks = self.locks.lock().map_err(|e| Error::storage(e.to_string()))?;
        let now = Instant::now();
        let deadline = now + duration;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1));

        if let Some(entry) = locks.get_mut(memory_id) {
            if entry.is_live(now) {
                if entry.info.holder_agent_id != agent_id {
                    return Ok(Attempt::Busy {
                        holder: entry.info.holder_agent_id.clone(),
                        deadline: entry.deadline,
                    });
                }
                // Re-entrant: extend and hand back the same token
                entry.deadline = entry.deadline.max(deadline);
                entry.info.expires_at = entry.info.expires_at.max(expires_at);
                return Ok(Attempt::Granted(entry.info.token));
            }
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }

        let token = LockToken(Uuid::new_v4());
        locks.insert(
            memory_id.to_string(),
            LockEntry {
                info: LockInfo {
                    memory_id: memory_id.to_string(),
                    holder_agent_id: agent_id.to_string(),
                    acquired_at: Utc::now(),
                    expires_at,
                    token,
                },
                deadline,
            },
        );
        self.acquired_count.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(memory_id = %memory_id, agent_id = %agent_id, "Lock acquired");
        Ok(Attempt::Granted(token))
    }

    /// Acquire the lock on `memory_id` for `agent_id`.
    ///
    /// With `wait = false` a lock held by someone else fails immediately with
    /// `ResourceBusy`. With `wait = true` the caller parks until the lock is
    /// released or expires, failing with `Timeout` once the wait bound passes.
    pub async fn acquire(
        &self,
        memory_id: &str,
        agent_id: &str,
        duration: Option<Duration>,
        wait: bool,
    ) -> Result<LockToken> {
        let duration = duration.unwrap_or(self.default_duration);
        let started = Instant::now();
        let give_up_at = started + self.wait_timeout;

        loop {
            // Register interest before looking, so a release between the
            // check and the await is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (holder, deadline) = match self.attempt(memory_id, agent_id, duration)? {
                Attempt::Granted(token) => return Ok(token),
                Attempt::Busy { holder, deadline } => (holder, deadline),
            };

            if !wait {
                return Err(Error::ResourceBusy {
                    memory_id: memory_id.to_string(),
                    holder,
                });
            }

            if Instant::now() >= give_up_at {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    memory_id = %memory_id,
                    agent_id = %agent_id,
                    holder = %holder,
                    waited_ms,
                    "Lock wait timed out"
                );
                return Err(Error::Timeout {
                    memory_id: memory_id.to_string(),
                    waited_ms,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.min(give_up_at)) => {}
            }
        }
    }

    /// Acquire and wrap the lock in a guard that releases it on drop
    pub async fn acquire_guard(
        self: &Arc<Self>,
        memory_id: &str,
        agent_id: &str,
        duration: Option<Duration>,
        wait: bool,
    ) -> Result<LockGuard> {
        let token = self.acquire(memory_id, agent_id, duration, wait).await?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            memory_id: memory_id.to_string(),
            holder: agent_id.to_string(),
            token,
            released: false,
        })
    }

    /// Release a lock. `force` skips the ownership check.
    pub fn release(&self, memory_id: &str, agent_id: &str, token: LockToken, force: bool) -> Result<()> {
        let mut locks = self.locks.lock().map_err(|e| Error::storage(e.to_string()))?;
        let now = Instant::now();

        let matches = locks
            .get(memory_id)
            .map(|e| e.is_live(now) && e.info.token == token && e.info.holder_agent_id == agent_id)
            .unwrap_or(false);

        if !matches && !force {
            return Err(Error::InvalidToken(memory_id.to_string()));
        }

        if locks.remove(memory_id).is_some() {
            self.released_count.fetch_add(1, Ordering::Relaxed);
            if force && !matches {
                tracing::warn!(memory_id = %memory_id, agent_id = %agent_id, "Lock force-released");
            }
        }
        drop(locks);

        self.released.notify_waiters();
        Ok(())
    }

    /// Check that `token` is the live lock on `memory_id`
    pub fn validate(&self, memory_id: &str, token: LockToken) -> Result<()> {
        let locks = self.locks.lock().map_err(|e| Error::storage(e.to_string()))?;
        match locks.get(memory_id) {
            Some(entry) if entry.is_live(Instant::now()) && entry.info.token == token => Ok(()),
            _ => Err(Error::InvalidToken(memory_id.to_string())),
        }
    }

    /// The live lock on `memory_id`, if any
    pub fn holder(&self, memory_id: &str) -> Option<LockInfo> {
        let locks = self.locks.lock().ok()?;
        locks
            .get(memory_id)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.info.clone())
    }

    pub fn is_locked(&self, memory_id: &str) -> bool {
        self.holder(memory_id).is_some()
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let Ok(mut locks) = self.locks.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = locks.len();
        locks.retain(|_, e| e.is_live(now));
        let removed = before - locks.len();
        drop(locks);

        if removed > 0 {
            self.expired_count.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Cleaned up expired locks");
            self.released.notify_waiters();
        }
        removed
    }

    pub fn active_locks(&self) -> Vec<LockInfo> {
        let Ok(locks) = self.locks.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut active: Vec<LockInfo> = locks
            .values()
            .filter(|e| e.is_live(now))
            .map(|e| e.info.clone())
            .collect();
        active.sort_by(|a, b| a.memory_id.cmp(&b.memory_id));
        active
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            active: self.active_locks().len(),
            acquired: self.acquired_count.load(Ordering::Relaxed),
            released: self.released_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

/// A held lock, released when dropped
pub struct LockGuard {
    manager: Arc<LockManager>,
    memory_id: String,
    holder: String,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    pub fn memory_id(&self) -> &str {
        &self.memory_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Release now and report the outcome
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager
            .release(&self.memory_id, &self.holder, self.token, false)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .manager
            .release(&self.memory_id, &self.holder, self.token, false)
        {
            // Already expired or force-released
            tracing::debug!(memory_id = %self.memory_id, error = %e, "Lock guard release skipped");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("memory_id", &self.memory_id)
            .field("holder", &self.holder)
            .field("token", &self.token)
            .finish()
    }
}
