// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local lock manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{LockError, LockHandle, LockManager};

#[derive(Debug)]
struct Held {
    owner: String,
    expires_at: Instant,
}

/// Lock manager backed by an in-process map. Suitable for a single engine
/// process; use the Redis backend when several processes share a database.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Held>>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let mut table = self.table()?;
        let now = Instant::now();

        if let Some(held) = table.get(key)
            && held.expires_at > now
        {
            return Ok(None);
        }

        let handle = LockHandle::new(key, ttl);
        table.insert(
            key.to_string(),
            Held {
                owner: handle.owner().to_string(),
                expires_at: handle.expires_at(),
            },
        );
        debug!(key = %key, owner = %handle.owner(), "Lock acquired");

        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut table = self.table()?;

        match table.get(handle.key()) {
            Some(held) if held.owner == handle.owner() => {
                table.remove(handle.key());
                debug!(key = %handle.key(), "Lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
