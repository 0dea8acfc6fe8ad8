// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chain executor: enqueues chains and runs one queued step at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{JobRecord, NewJob, Persistence, TaskRecord};
use crate::registry::ChainRegistry;
use crate::sync::ResourceSync;
use crate::task::TaskStatus;

use super::{StepContext, StepOutcome, StepRegistry, StepSpec};

/// Reference to a started chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHandle {
    /// Task the chain runs for.
    pub task_id: String,
    /// Queue row of the first step; `None` for an empty chain.
    pub job_id: Option<i64>,
    /// Number of steps.
    pub steps: usize,
}

/// What happened when a queued job was executed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// The step succeeded and the next one was enqueued.
    Advanced {
        /// Task ID.
        task_id: String,
        /// Position of the step now queued.
        next_position: usize,
    },
    /// The step released and will be redelivered.
    Released {
        /// Task ID.
        task_id: String,
        /// Executions of this step so far.
        attempts: u32,
        /// When the step becomes due again.
        retry_at: DateTime<Utc>,
    },
    /// The final step succeeded; the task is complete.
    ChainCompleted(Box<TaskRecord>),
    /// A step failed or ran out of retries; the task is failed.
    ChainFailed(Box<TaskRecord>),
    /// The job no longer had a live task, or its claim passed to another
    /// worker, and was dropped without applying an outcome.
    Discarded {
        /// Task ID.
        task_id: String,
    },
}

/// Starts chains and executes their queued steps.
#[derive(Clone)]
pub struct ChainExecutor {
    persistence: Arc<dyn Persistence>,
    sync: Arc<ResourceSync>,
    steps: Arc<StepRegistry>,
    chains: Arc<ChainRegistry>,
}

impl ChainExecutor {
    /// Create an executor. `chains` lets steps start teardown of dependent
    /// resources.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        sync: Arc<ResourceSync>,
        steps: Arc<StepRegistry>,
        chains: Arc<ChainRegistry>,
    ) -> Self {
        Self {
            persistence,
            sync,
            steps,
            chains,
        }
    }

    /// Registered steps.
    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    /// Chain factories.
    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Storage.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Capability contract.
    pub fn sync(&self) -> &ResourceSync {
        &self.sync
    }

    /// Enqueue the first step of a chain for `task_id` and return
    /// immediately. An empty chain completes the task on the spot. A chain
    /// naming an unregistered step fails the task and is rejected.
    #[instrument(skip(self, steps), fields(steps = steps.len()))]
    pub async fn start(&self, task_id: &str, steps: Vec<StepSpec>) -> Result<ChainHandle> {
        if steps.is_empty() {
            self.sync.complete_mutation(task_id).await?;
            return Ok(ChainHandle {
                task_id: task_id.to_string(),
                job_id: None,
                steps: 0,
            });
        }

        if let Some(unknown) = steps.iter().find(|spec| !self.steps.contains(&spec.name)) {
            let err = CoreError::UnknownStep {
                step: unknown.name.clone(),
            };
            self.sync.fail_mutation(task_id, &err.to_string()).await?;
            return Err(err);
        }

        let count = steps.len();
        let job_id = self
            .persistence
            .enqueue_job(&NewJob {
                task_id: task_id.to_string(),
                steps,
                position: 0,
                available_at: Utc::now(),
            })
            .await?;

        info!(task_id = %task_id, job_id, steps = count, "Chain started");

        Ok(ChainHandle {
            task_id: task_id.to_string(),
            job_id: Some(job_id),
            steps: count,
        })
    }

    /// Run the step a claimed job points at and apply its outcome.
    ///
    /// The claim is renewed for `lease` before the step runs and checked
    /// again before the outcome is applied. A job whose claim was taken over
    /// by another worker is [`JobResult::Discarded`] and its step is not run.
    #[instrument(
        skip(self, job),
        fields(job_id = job.id, task_id = %job.task_id, position = job.position)
    )]
    pub async fn execute(&self, job: &JobRecord, lease: Duration) -> Result<JobResult> {
        if !self.persistence.renew_job_lease(job, lease_until(lease)).await? {
            return Ok(self.claim_lost(job));
        }

        let task = match self.persistence.get_task(&job.task_id).await? {
            Some(task) if task.status() == TaskStatus::InProgress => task,
            Some(task) => {
                debug!(status = %task.status, "Task no longer in progress, dropping job");
                return self.discard(job).await;
            }
            None => {
                warn!("Task missing, dropping job");
                return self.discard(job).await;
            }
        };

        let Some(spec) = job.current_step() else {
            let reason = format!("Chain position {} out of range", job.position);
            return self.fail(job, &task.id, &reason, lease).await;
        };

        let attempt = u32::try_from(job.attempts).unwrap_or(0) + 1;
        let outcome = match self.steps.get(&spec.name) {
            None => StepOutcome::Fail(
                CoreError::UnknownStep {
                    step: spec.name.clone(),
                }
                .to_string(),
            ),
            Some(step) => {
                debug!(step = %spec.name, attempt, "Running step");
                let ctx = StepContext::new(task, spec, attempt, self);
                match step.run(&ctx).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(step = %spec.name, error = %e, "Step errored");
                        StepOutcome::Fail(e.to_string())
                    }
                }
            }
        };

        match outcome {
            StepOutcome::Success => self.advance(job, spec, lease).await,
            StepOutcome::Release(delay) => self.release(job, spec, attempt, delay, lease).await,
            StepOutcome::Fail(reason) => self.fail(job, &job.task_id, &reason, lease).await,
        }
    }

    async fn advance(
        &self,
        job: &JobRecord,
        spec: &StepSpec,
        lease: Duration,
    ) -> Result<JobResult> {
        if job.is_last_step() {
            // The task must only be completed by the claim holder.
            if !self.persistence.renew_job_lease(job, lease_until(lease)).await? {
                return Ok(self.claim_lost(job));
            }
            let task = self.sync.complete_mutation(&job.task_id).await?;
            self.persistence.advance_job(job, None).await?;
            info!(task_id = %job.task_id, step = %spec.name, "Chain completed");
            return Ok(JobResult::ChainCompleted(Box::new(task)));
        }

        let next_position = job.position + 1;
        let advanced = self
            .persistence
            .advance_job(
                job,
                Some(&NewJob {
                    task_id: job.task_id.clone(),
                    steps: job.steps.0.clone(),
                    position: next_position,
                    available_at: Utc::now(),
                }),
            )
            .await?;
        if !advanced {
            return Ok(self.claim_lost(job));
        }

        debug!(task_id = %job.task_id, step = %spec.name, next_position, "Step succeeded");
        Ok(JobResult::Advanced {
            task_id: job.task_id.clone(),
            next_position: usize::try_from(next_position).unwrap_or_default(),
        })
    }

    async fn release(
        &self,
        job: &JobRecord,
        spec: &StepSpec,
        attempt: u32,
        delay: Duration,
        lease: Duration,
    ) -> Result<JobResult> {
        if attempt >= spec.max_attempts {
            let reason = format!(
                "Step '{}' retries exhausted after {} attempts",
                spec.name, attempt
            );
            return self.fail(job, &job.task_id, &reason, lease).await;
        }

        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let attempts = i32::try_from(attempt).unwrap_or(i32::MAX);
        if !self.persistence.release_job(job, attempts, retry_at).await? {
            return Ok(self.claim_lost(job));
        }

        debug!(
            task_id = %job.task_id,
            step = %spec.name,
            attempt,
            max_attempts = spec.max_attempts,
            delay_secs = delay.as_secs(),
            "Step released"
        );
        Ok(JobResult::Released {
            task_id: job.task_id.clone(),
            attempts: attempt,
            retry_at,
        })
    }

    async fn fail(
        &self,
        job: &JobRecord,
        task_id: &str,
        reason: &str,
        lease: Duration,
    ) -> Result<JobResult> {
        if !self.persistence.renew_job_lease(job, lease_until(lease)).await? {
            return Ok(self.claim_lost(job));
        }
        let task = self.sync.fail_mutation(task_id, reason).await?;
        self.persistence.delete_job(job).await?;
        Ok(JobResult::ChainFailed(Box::new(task)))
    }

    async fn discard(&self, job: &JobRecord) -> Result<JobResult> {
        self.persistence.delete_job(job).await?;
        Ok(JobResult::Discarded {
            task_id: job.task_id.clone(),
        })
    }

    fn claim_lost(&self, job: &JobRecord) -> JobResult {
        warn!(job_id = job.id, task_id = %job.task_id, "Job claim lost, dropping delivery");
        JobResult::Discarded {
            task_id: job.task_id.clone(),
        }
    }
}

fn lease_until(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
