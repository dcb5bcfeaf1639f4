//! Per-document distributed mutex.
//!
//! A lock is held iff its key exists and has not expired. Acquisition is
//! "set if absent with expiry"; release is an atomic compare-and-delete on
//! the caller's owner token, which fences out stale owners whose TTL
//! already lapsed. Contention is handled with a bounded spin: retry on a
//! small fixed interval until a hard deadline.
//!
//! Losing the lock mid-work is tolerated everywhere it is used. The lock
//! only serializes the common case; the document store's version gate is
//! what keeps concurrent writers correct, so a timed-out acquisition
//! degrades the write path to pure optimistic concurrency instead of
//! failing it.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8
//! (fencing against stale lock holders)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default time-to-live for a document lock.
pub const LOCK_TTL: Duration = Duration::from_secs(10);
/// Hard deadline for lock acquisition.
pub const ACQUIRE_DEADLINE: Duration = Duration::from_secs(3);
/// Fixed retry interval while spinning on a held lock.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Key for a document's write lock.
pub fn doc_lock_key(doc_id: Uuid) -> String {
    format!("lock:doc:{doc_id}")
}

/// Mutual exclusion with owner tokens and TTLs.
///
/// Injected as `Arc<dyn LockService>`; production deployments back this
/// with a shared store, tests and single-node servers use
/// [`MemoryLockService`].
#[async_trait]
pub trait LockService: Send + Sync {
    /// Atomic "set if absent with expiry". Returns true only if the
    /// caller now holds the lock.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool;

    /// Atomic compare-and-delete: releases only if the stored value
    /// equals `owner`. Returns whether a release happened.
    async fn release(&self, key: &str, owner: &str) -> bool;
}

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process lock table with TTL expiry.
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key is currently held (test helper).
    pub async fn is_held(&self, key: &str) -> bool {
        let locks = self.locks.lock().await;
        locks.get(key).is_some_and(|e| !e.is_expired())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if !entry.is_expired() => false,
            Some(entry) => {
                log::debug!("taking expired lock {key} from {}", entry.owner);
                locks.insert(
                    key.to_string(),
                    LockEntry { owner: owner.to_string(), expires_at: Instant::now() + ttl },
                );
                true
            }
            None => {
                locks.insert(
                    key.to_string(),
                    LockEntry { owner: owner.to_string(), expires_at: Instant::now() + ttl },
                );
                true
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> bool {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|e| e.owner == owner) {
            locks.remove(key);
            true
        } else {
            false
        }
    }
}

/// Spin on `try_acquire` until success or the deadline.
///
/// Returns whether the lock was won. Callers proceed either way; a `false`
/// here only costs extra version-gate retries under contention.
pub async fn acquire_with_deadline(
    locks: &dyn LockService,
    key: &str,
    owner: &str,
    ttl: Duration,
    deadline: Duration,
) -> bool {
    let give_up_at = Instant::now() + deadline;
    loop {
        if locks.try_acquire(key, owner, ttl).await {
            return true;
        }
        if Instant::now() + RETRY_INTERVAL >= give_up_at {
            log::warn!("lock acquisition timed out for {key}; proceeding optimistically");
            return false;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}
