// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::worker::WorkerConfig;

/// Timing of the per-resource sync lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long a held lock survives without being released.
    pub ttl: Duration,
    /// How long a caller blocks waiting for the lock before giving up.
    pub max_wait: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_wait: Duration::from_secs(60),
        }
    }
}

/// eCloud engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Redis URL for distributed locks; in-process locks are used when absent
    pub redis_url: Option<String>,
    /// Number of queue workers to spawn
    pub worker_count: usize,
    /// Per-worker polling behaviour
    pub worker: WorkerConfig,
    /// Sync lock timing
    pub lock: LockSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ECLOUD_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `ECLOUD_REDIS_URL`: Redis connection string (default: none, in-process locks)
    /// - `ECLOUD_WORKER_COUNT`: Queue workers (default: 4)
    /// - `ECLOUD_WORKER_POLL_INTERVAL_MS`: Queue poll interval (default: 1000)
    /// - `ECLOUD_WORKER_BATCH_SIZE`: Jobs claimed per poll (default: 10)
    /// - `ECLOUD_JOB_LEASE_SECS`: Claim lease before a job is redelivered (default: 300)
    /// - `ECLOUD_SYNC_LOCK_TTL_SECS`: Sync lock TTL (default: 60)
    /// - `ECLOUD_SYNC_LOCK_WAIT_SECS`: Sync lock wait (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ECLOUD_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ECLOUD_DATABASE_URL"))?;

        let redis_url = std::env::var("ECLOUD_REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let worker_count: usize =
            parse_var("ECLOUD_WORKER_COUNT", "4", "must be a positive integer")?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "ECLOUD_WORKER_COUNT",
                "must be a positive integer",
            ));
        }

        let poll_interval_ms: u64 = parse_var(
            "ECLOUD_WORKER_POLL_INTERVAL_MS",
            "1000",
            "must be a number of milliseconds",
        )?;
        let batch_size: i64 =
            parse_var("ECLOUD_WORKER_BATCH_SIZE", "10", "must be a positive integer")?;
        let lease_secs: u64 =
            parse_var("ECLOUD_JOB_LEASE_SECS", "300", "must be a number of seconds")?;
        let lock_ttl_secs: u64 =
            parse_var("ECLOUD_SYNC_LOCK_TTL_SECS", "60", "must be a number of seconds")?;
        let lock_wait_secs: u64 =
            parse_var("ECLOUD_SYNC_LOCK_WAIT_SECS", "60", "must be a number of seconds")?;

        Ok(Self {
            database_url,
            redis_url,
            worker_count,
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                batch_size,
                lease: Duration::from_secs(lease_secs),
            },
            lock: LockSettings {
                ttl: Duration::from_secs(lock_ttl_secs),
                max_wait: Duration::from_secs(lock_wait_secs),
            },
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, hint))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
