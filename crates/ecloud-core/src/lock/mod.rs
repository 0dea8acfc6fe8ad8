// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-resource mutual exclusion.
//!
//! A lock is a named, time-limited, owner-tagged mutex. Acquiring it yields a
//! [`LockHandle`] that must be handed back to [`LockManager::release`]; only
//! the holder of the matching owner token can release it, and the TTL frees
//! locks whose holder crashed.
//!
//! | Backend | Scope |
//! |---------|-------|
//! | [`InMemoryLockManager`] | single process (embedded, tests) |
//! | `RedisLockManager` | every process sharing the Redis instance |

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use self::memory::InMemoryLockManager;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockManager;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

/// Interval between acquisition attempts while blocking.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Lock key guarding mutations of a resource.
pub fn sync_lock_key(resource_id: &str) -> String {
    format!("sync.{}", resource_id)
}

/// Proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    owner: String,
    expires_at: Instant,
}

impl LockHandle {
    /// Create a handle with a fresh owner token.
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner: Uuid::new_v4().to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token; only this token can release the lock.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// When the lock lapses if never released.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Lock errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The lock stayed held by someone else for the whole wait budget.
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    Timeout {
        /// Lock key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The backing store failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Named mutual-exclusion service.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock if it is free. Never blocks on a held lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError>;

    /// Release a held lock. Returns false if the handle no longer owns it
    /// (expired and possibly re-acquired by someone else).
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Block until the lock is acquired or `max_wait` elapses.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        loop {
            if let Some(handle) = self.try_acquire(key, ttl).await? {
                return Ok(handle);
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(RETRY_INTERVAL.min(max_wait - waited)).await;
        }
    }
}
