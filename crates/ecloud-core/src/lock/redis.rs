// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed lock manager.
//!
//! Acquisition is `SET key owner NX PX ttl`; release is an atomic
//! compare-and-delete script so an expired holder cannot free a lock that
//! has since been re-acquired.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{LockError, LockHandle, LockManager};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock manager shared by every process connected to the same Redis.
#[derive(Clone)]
pub struct RedisLockManager {
    connection_manager: ConnectionManager,
}

impl RedisLockManager {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)
            .map_err(|e| LockError::Backend(format!("invalid Redis URL: {}", e)))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Backend(format!("Redis connection failed: {}", e)))?;

        debug!("Redis lock manager connected");
        Ok(Self { connection_manager })
    }
}

impl std::fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockManager").finish_non_exhaustive()
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let mut conn = self.connection_manager.clone();
        let handle = LockHandle::new(key, ttl);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(handle.owner())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Redis SET NX failed: {}", e)))?;

        if reply.is_some() {
            debug!(key = %key, owner = %handle.owner(), "Lock acquired");
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut conn = self.connection_manager.clone();

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(handle.key())
            .arg(handle.owner())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Redis lock release failed: {}", e)))?;

        debug!(key = %handle.key(), released = deleted > 0, "Lock release");
        Ok(deleted > 0)
    }
}
