// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue worker.
//!
//! Polls the job queue for due steps, claims a batch and executes each one
//! through the [`ChainExecutor`](crate::chain::ChainExecutor). Each job's
//! lease is renewed as it starts, so a slow batch does not outlive the
//! leases of the jobs still waiting in it. A job whose worker dies keeps its
//! lease until it expires and is then redelivered under a new claim.
//!
//! When a delete chain completes, the worker runs the second phase of the
//! delete so the local record is removed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::chain::JobResult;
use crate::error::Result;
use crate::lifecycle::{DeleteOutcome, ResourceLifecycle};
use crate::task::TaskType;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How often to poll for due jobs
    pub poll_interval: Duration,
    /// Maximum jobs to claim per poll
    pub batch_size: i64,
    /// How long a claimed job stays invisible to other workers
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            lease: Duration::from_secs(300),
        }
    }
}

/// Queue worker that runs as a background task.
pub struct Worker {
    id: usize,
    lifecycle: Arc<ResourceLifecycle>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    /// Create a worker. `id` only labels its logs.
    pub fn new(id: usize, lifecycle: Arc<ResourceLifecycle>, config: WorkerConfig) -> Self {
        Self {
            id,
            lifecycle,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            worker = self.id,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis())
                .unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(worker = self.id, "Worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_due_jobs().await {
                        error!(worker = self.id, error = %e, "Failed to process due jobs");
                    }
                }
            }
        }
    }

    /// Claim and execute one batch of due jobs. Returns how many were
    /// claimed. A failing job does not stop the rest of the batch.
    pub async fn process_due_jobs(&self) -> Result<usize> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.config.lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let jobs = self
            .lifecycle
            .persistence()
            .claim_due_jobs(now, lease_until, self.config.batch_size)
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(worker = self.id, count = jobs.len(), "Claimed due jobs");

        for job in &jobs {
            match self.lifecycle.executor().execute(job, self.config.lease).await {
                Ok(JobResult::ChainCompleted(task))
                    if task.task_type() == Some(TaskType::Delete) =>
                {
                    match self.lifecycle.finalize_delete(&task).await {
                        Ok(DeleteOutcome::Deleted) => {}
                        Ok(outcome) => {
                            error!(task_id = %task.id, ?outcome, "Delete did not finalize");
                        }
                        Err(e) => {
                            error!(task_id = %task.id, error = %e, "Failed to finalize delete");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // The lease expires and the job is redelivered.
                    error!(
                        worker = self.id,
                        job_id = job.id,
                        task_id = %job.task_id,
                        error = %e,
                        "Failed to execute job"
                    );
                }
            }
        }

        Ok(jobs.len())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lease, Duration::from_secs(300));
    }
}
