// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource capability contract.
//!
//! [`ResourceSync`] answers "what is this resource's sync status" and "may it
//! be mutated now", and opens and closes units of work. Opening a unit of
//! work always happens under the resource's sync lock, so the check and the
//! insert cannot interleave with another caller's.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::types::Json;
use tracing::{debug, info, warn};

use crate::config::LockSettings;
use crate::error::{BusyReason, CoreError, Result};
use crate::lock::{LockManager, sync_lock_key};
use crate::persistence::{Persistence, TaskRecord};
use crate::resource::ResourceKind;
use crate::task::{SyncStatus, TaskStatus, TaskType, generate_task_id};

/// Outcome of asking to delete a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteGate {
    /// Remote teardown already completed; local removal may proceed.
    Proceed,
    /// A delete unit of work was opened; removal must wait for its chain.
    Pending(Box<TaskRecord>),
}

/// Capability contract shared by every mutable resource.
pub struct ResourceSync {
    persistence: Arc<dyn Persistence>,
    locks: Arc<dyn LockManager>,
    settings: LockSettings,
}

impl ResourceSync {
    /// Create the contract over the given storage and lock backend.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        locks: Arc<dyn LockManager>,
        settings: LockSettings,
    ) -> Self {
        Self {
            persistence,
            locks,
            settings,
        }
    }

    /// Storage.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Status of the latest unit of work; implicitly complete when there is
    /// none.
    pub async fn current_status(&self, resource_id: &str) -> Result<SyncStatus> {
        Ok(self
            .persistence
            .latest_task(resource_id)
            .await?
            .map(|task| SyncStatus::of(&task))
            .unwrap_or_else(SyncStatus::implicit_complete))
    }

    /// Why a mutation of type `intended` would be refused, if it would be.
    ///
    /// A resource whose only unit of work failed can never be updated: it
    /// never existed remotely, so there is nothing to reconcile. Deleting it
    /// is still allowed.
    pub async fn mutation_blocker(
        &self,
        resource_id: &str,
        intended: TaskType,
    ) -> Result<Option<BusyReason>> {
        let Some(latest) = self.persistence.latest_task(resource_id).await? else {
            return Ok(None);
        };

        if latest.status() == TaskStatus::InProgress {
            return Ok(Some(BusyReason::InProgress));
        }

        if intended == TaskType::Update
            && latest.status() == TaskStatus::Failed
            && self.persistence.count_tasks(resource_id).await? == 1
        {
            return Ok(Some(BusyReason::Failed));
        }

        Ok(None)
    }

    /// Whether a mutation of type `intended` may start now.
    pub async fn can_mutate(&self, resource_id: &str, intended: TaskType) -> Result<bool> {
        Ok(self
            .mutation_blocker(resource_id, intended)
            .await?
            .is_none())
    }

    /// Open a `sync_<type>` unit of work.
    pub async fn begin_mutation(
        &self,
        resource_id: &str,
        task_type: TaskType,
    ) -> Result<TaskRecord> {
        self.begin_task(
            resource_id,
            &task_type.sync_name(),
            task_type,
            Value::Object(Map::new()),
        )
        .await
    }

    /// Open a named unit of work carrying initial data.
    pub async fn begin_task(
        &self,
        resource_id: &str,
        name: &str,
        task_type: TaskType,
        data: Value,
    ) -> Result<TaskRecord> {
        self.with_lock(resource_id, || async {
            if let Some(reason) = self.mutation_blocker(resource_id, task_type).await? {
                debug!(resource_id = %resource_id, ?reason, "Mutation refused");
                return Err(CoreError::ResourceBusy {
                    resource_id: resource_id.to_string(),
                    reason,
                });
            }
            self.insert_task(resource_id, name, task_type, data).await
        })
        .await
    }

    /// Open a unit of work even if the resource is in the failed lockout.
    /// An in-flight unit of work still blocks.
    pub async fn force_mutation(
        &self,
        resource_id: &str,
        task_type: TaskType,
    ) -> Result<TaskRecord> {
        self.with_lock(resource_id, || async {
            if let Some(BusyReason::InProgress) =
                self.mutation_blocker(resource_id, task_type).await?
            {
                return Err(CoreError::ResourceBusy {
                    resource_id: resource_id.to_string(),
                    reason: BusyReason::InProgress,
                });
            }
            warn!(resource_id = %resource_id, task_type = task_type.as_str(), "Forcing mutation");
            self.insert_task(
                resource_id,
                &task_type.sync_name(),
                task_type,
                Value::Object(Map::new()),
            )
            .await
        })
        .await
    }

    /// First phase of a delete: proceed if remote teardown already
    /// completed, otherwise open a delete unit of work.
    pub async fn begin_delete(&self, resource_id: &str) -> Result<DeleteGate> {
        self.with_lock(resource_id, || async {
            if let Some(latest) = self.persistence.latest_task(resource_id).await?
                && latest.status() == TaskStatus::Complete
                && latest.task_type() == Some(TaskType::Delete)
            {
                return Ok(DeleteGate::Proceed);
            }

            if let Some(reason) = self.mutation_blocker(resource_id, TaskType::Delete).await? {
                return Err(CoreError::ResourceBusy {
                    resource_id: resource_id.to_string(),
                    reason,
                });
            }

            let task = self
                .insert_task(
                    resource_id,
                    &TaskType::Delete.sync_name(),
                    TaskType::Delete,
                    Value::Object(Map::new()),
                )
                .await?;
            Ok(DeleteGate::Pending(Box::new(task)))
        })
        .await
    }

    /// Mark a unit of work complete. Completing an already complete task is a
    /// no-op; a failed task stays failed.
    pub async fn complete_mutation(&self, task_id: &str) -> Result<TaskRecord> {
        let changed = self.persistence.complete_task(task_id).await?;
        let task = self.load_task(task_id).await?;

        if changed {
            info!(
                task_id = %task_id,
                resource_id = %task.resource_id,
                task_type = %task.task_type,
                "Task complete"
            );
        } else if task.status() == TaskStatus::Failed {
            warn!(task_id = %task_id, "Ignoring completion of failed task");
        }

        Ok(task)
    }

    /// Mark a unit of work failed. The latest reason wins; a complete task is
    /// left untouched.
    pub async fn fail_mutation(&self, task_id: &str, reason: &str) -> Result<TaskRecord> {
        let changed = self.persistence.fail_task(task_id, reason).await?;
        let task = self.load_task(task_id).await?;

        if changed {
            warn!(
                task_id = %task_id,
                resource_id = %task.resource_id,
                task_type = %task.task_type,
                reason = %reason,
                "Task failed"
            );
        } else {
            warn!(task_id = %task_id, reason = %reason, "Ignoring failure of complete task");
        }

        Ok(task)
    }

    /// Run `f` while holding the resource's sync lock. The lock is released
    /// whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, resource_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = sync_lock_key(resource_id);
        let handle = self
            .locks
            .acquire(&key, self.settings.ttl, self.settings.max_wait)
            .await?;

        let result = f().await;

        match self.locks.release(&handle).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %key, "Sync lock expired before release"),
            Err(e) => warn!(key = %key, error = %e, "Failed to release sync lock"),
        }

        result
    }

    async fn load_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn insert_task(
        &self,
        resource_id: &str,
        name: &str,
        task_type: TaskType,
        data: Value,
    ) -> Result<TaskRecord> {
        let kind = ResourceKind::from_id(resource_id)?;
        let now = Utc::now();
        let data = match data {
            Value::Object(_) => data,
            _ => Value::Object(Map::new()),
        };

        let task = TaskRecord {
            id: generate_task_id(),
            resource_id: resource_id.to_string(),
            resource_type: kind.as_str().to_string(),
            name: name.to_string(),
            task_type: task_type.as_str().to_string(),
            status: TaskStatus::InProgress.as_str().to_string(),
            failure_reason: None,
            data: Json(data),
            created_at: now,
            updated_at: now,
        };
        self.persistence.insert_task(&task).await?;

        info!(
            task_id = %task.id,
            resource_id = %resource_id,
            task_type = task_type.as_str(),
            name = %name,
            "Task created"
        );

        Ok(task)
    }
}

impl std::fmt::Debug for ResourceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSync")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
