// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`EngineRuntime`] wires persistence, locks and the registries into a
//! [`ResourceLifecycle`] and spawns the queue workers on the current tokio
//! runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ecloud_core::persistence::SqlitePersistence;
//! use ecloud_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::in_memory().await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .steps(my_steps())
//!         .chains(my_chains())
//!         .hooks(my_hooks())
//!         .worker_count(2)
//!         .start()
//!         .await?;
//!
//!     runtime.lifecycle().save(&mut resource).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::chain::StepRegistry;
use crate::config::{Config, LockSettings};
use crate::lifecycle::{HookRegistry, ResourceLifecycle};
use crate::lock::{InMemoryLockManager, LockManager};
use crate::persistence::Persistence;
use crate::registry::ChainRegistry;
use crate::worker::{Worker, WorkerConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    locks: Option<Arc<dyn LockManager>>,
    steps: StepRegistry,
    chains: ChainRegistry,
    hooks: HookRegistry,
    lock_settings: LockSettings,
    worker_count: usize,
    worker_config: WorkerConfig,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            locks: None,
            steps: StepRegistry::new(),
            chains: ChainRegistry::new(),
            hooks: HookRegistry::new(),
            lock_settings: LockSettings::default(),
            worker_count: 4,
            worker_config: WorkerConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply worker and lock settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.worker_count = config.worker_count;
        self.worker_config = config.worker.clone();
        self.lock_settings = config.lock;
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the lock backend.
    ///
    /// Default: in-process locks, only safe with a single engine process.
    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the step registry.
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Set the chain registry.
    pub fn chains(mut self, chains: ChainRegistry) -> Self {
        self.chains = chains;
        self
    }

    /// Set the lifecycle reactions.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the sync lock timing.
    ///
    /// Default: 60 second TTL, 60 second wait
    pub fn lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = settings;
        self
    }

    /// Set the number of queue workers. Zero spawns none, leaving the queue
    /// to be drained by another process.
    ///
    /// Default: 4
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the per-worker configuration.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Build the lifecycle without spawning workers.
    pub fn build(self) -> Result<ResourceLifecycle> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(InMemoryLockManager::new()));

        Ok(ResourceLifecycle::new(
            persistence,
            locks,
            self.lock_settings,
            self.steps,
            self.chains,
            self.hooks,
        ))
    }

    /// Build the lifecycle and spawn the workers.
    pub async fn start(self) -> Result<EngineRuntime> {
        let worker_count = self.worker_count;
        let worker_config = self.worker_config.clone();
        let lifecycle = Arc::new(self.build()?);

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = Worker::new(id, lifecycle.clone(), worker_config.clone());
            let shutdown = worker.shutdown_handle();
            let handle = tokio::spawn(async move {
                worker.run().await;
            });
            workers.push((shutdown, handle));
        }

        info!(
            workers = worker_count,
            steps = ?lifecycle.executor().steps().names(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime { lifecycle, workers })
    }
}

/// A running engine: the lifecycle plus its queue workers.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    lifecycle: Arc<ResourceLifecycle>,
    workers: Vec<(Arc<Notify>, JoinHandle<()>)>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Entry point for saves, deletes and named tasks.
    pub fn lifecycle(&self) -> &Arc<ResourceLifecycle> {
        &self.lifecycle
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|(_, handle)| !handle.is_finished())
    }

    /// Signal every worker to stop and wait for them. A worker finishes the
    /// job it is executing first.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        for (shutdown, _) in &self.workers {
            shutdown.notify_one();
        }

        for (id, (_, handle)) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Worker {} task panicked: {}", id, e);
            }
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_persistence() {
        let err = EngineRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("persistence is required"));
    }
}
