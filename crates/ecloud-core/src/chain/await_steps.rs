// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Await/gate primitives.
//!
//! Gates hold a chain until other units of work (or other resources' syncs)
//! finish. A failed dependency fails the waiting chain with a reason naming
//! it; a pending one releases the step with its backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::CoreError;
use crate::persistence::Persistence;
use crate::sync::ResourceSync;
use crate::task::TaskStatus;

use super::{Step, StepContext, StepError, StepOutcome, StepSpec};

/// Default number of polls before a gate gives up.
pub const DEFAULT_AWAIT_ATTEMPTS: u32 = 60;

/// Default delay between polls.
pub const DEFAULT_AWAIT_BACKOFF: Duration = Duration::from_secs(5);

/// Aggregate state of a set of dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitState {
    /// Every dependency completed (or there were none).
    Ready,
    /// At least one dependency is still in progress.
    Pending,
    /// A dependency failed; the reason names it.
    Failed(String),
}

impl AwaitState {
    /// Translate into a step outcome, releasing with `backoff` while pending.
    pub fn into_outcome(self, backoff: Duration) -> StepOutcome {
        match self {
            Self::Ready => StepOutcome::Success,
            Self::Pending => StepOutcome::Release(backoff),
            Self::Failed(reason) => StepOutcome::Fail(reason),
        }
    }
}

/// Status of the given units of work. Any failure (or unknown ID) wins over
/// pending.
pub async fn await_tasks(
    persistence: &dyn Persistence,
    task_ids: &[String],
) -> Result<AwaitState, CoreError> {
    let mut pending = false;

    for task_id in task_ids {
        match persistence.get_task(task_id).await? {
            None => return Ok(AwaitState::Failed(format!("Task '{}' not found", task_id))),
            Some(task) => match task.status() {
                TaskStatus::Failed => {
                    return Ok(AwaitState::Failed(format!(
                        "Task '{}' in failed state",
                        task_id
                    )));
                }
                TaskStatus::InProgress => pending = true,
                TaskStatus::Complete => {}
            },
        }
    }

    Ok(if pending {
        AwaitState::Pending
    } else {
        AwaitState::Ready
    })
}

/// Sync status of the given resources. Any failure (or unknown ID) wins
/// over pending.
pub async fn await_resource_sync(
    sync: &ResourceSync,
    resource_ids: &[String],
) -> Result<AwaitState, CoreError> {
    let mut pending = false;

    for resource_id in resource_ids {
        if sync.persistence().get_resource(resource_id).await?.is_none() {
            return Ok(AwaitState::Failed(format!(
                "Resource '{}' not found",
                resource_id
            )));
        }
        match sync.current_status(resource_id).await?.status {
            TaskStatus::Failed => {
                return Ok(AwaitState::Failed(format!(
                    "Resource '{}' in failed sync state",
                    resource_id
                )));
            }
            TaskStatus::InProgress => pending = true,
            TaskStatus::Complete => {}
        }
    }

    Ok(if pending {
        AwaitState::Pending
    } else {
        AwaitState::Ready
    })
}

#[derive(Debug, Default, Deserialize)]
struct AwaitTasksPayload {
    #[serde(default)]
    task_ids: Vec<String>,
    #[serde(default)]
    data_key: Option<String>,
}

/// Gate on other units of work, listed in the payload or stored in the
/// task's data bag under `data_key`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaitTasks;

impl AwaitTasks {
    /// Registered name.
    pub const NAME: &'static str = "await.tasks";

    /// Gate on explicit task IDs with the default polling policy.
    pub fn spec(task_ids: &[String]) -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_payload(json!({ "task_ids": task_ids }))
            .polling(DEFAULT_AWAIT_ATTEMPTS, DEFAULT_AWAIT_BACKOFF)
    }

    /// Gate on task IDs that an earlier step stores under `data_key`.
    pub fn spec_from_data(data_key: &str) -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_payload(json!({ "data_key": data_key }))
            .polling(DEFAULT_AWAIT_ATTEMPTS, DEFAULT_AWAIT_BACKOFF)
    }
}

#[async_trait]
impl Step for AwaitTasks {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let payload: AwaitTasksPayload = if ctx.spec().payload.is_null() {
            AwaitTasksPayload::default()
        } else {
            ctx.payload()?
        };

        let mut task_ids = payload.task_ids;
        if let Some(key) = payload.data_key.as_deref() {
            task_ids.extend(ctx.task().data_ids(key));
        }

        if task_ids.is_empty() {
            debug!(task_id = %ctx.task().id, "No tasks to await, skipping");
            return Ok(StepOutcome::Success);
        }

        debug!(
            task_id = %ctx.task().id,
            awaiting = ?task_ids,
            attempt = ctx.attempt(),
            "Awaiting tasks"
        );
        let state = await_tasks(ctx.persistence().as_ref(), &task_ids).await?;
        Ok(state.into_outcome(ctx.spec().backoff()))
    }
}

#[derive(Debug, Deserialize)]
struct AwaitResourceSyncPayload {
    #[serde(default)]
    resource_ids: Vec<String>,
}

/// Gate on other resources reaching a complete sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaitResourceSync;

impl AwaitResourceSync {
    /// Registered name.
    pub const NAME: &'static str = "await.resource_sync";

    /// Gate on the given resources with the default polling policy.
    pub fn spec(resource_ids: &[String]) -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_payload(json!({ "resource_ids": resource_ids }))
            .polling(DEFAULT_AWAIT_ATTEMPTS, DEFAULT_AWAIT_BACKOFF)
    }
}

#[async_trait]
impl Step for AwaitResourceSync {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let payload: AwaitResourceSyncPayload = ctx.payload()?;
        if payload.resource_ids.is_empty() {
            return Ok(StepOutcome::Success);
        }

        debug!(
            task_id = %ctx.task().id,
            awaiting = ?payload.resource_ids,
            attempt = ctx.attempt(),
            "Awaiting resource sync"
        );
        let state = await_resource_sync(ctx.sync(), &payload.resource_ids).await?;
        Ok(state.into_outcome(ctx.spec().backoff()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_await_state_outcomes() {
        let backoff = Duration::from_secs(5);
        assert_eq!(AwaitState::Ready.into_outcome(backoff), StepOutcome::Success);
        assert_eq!(
            AwaitState::Pending.into_outcome(backoff),
            StepOutcome::Release(backoff)
        );
        assert_eq!(
            AwaitState::Failed("Task 'task-1' in failed state".to_string()).into_outcome(backoff),
            StepOutcome::Fail("Task 'task-1' in failed state".to_string())
        );
    }

    #[test]
    fn test_specs_use_default_polling_policy() {
        let spec = AwaitTasks::spec(&["task-1".to_string()]);
        assert_eq!(spec.name, "await.tasks");
        assert_eq!(spec.max_attempts, DEFAULT_AWAIT_ATTEMPTS);
        assert_eq!(spec.backoff(), DEFAULT_AWAIT_BACKOFF);
        assert_eq!(spec.payload, json!({ "task_ids": ["task-1"] }));

        let spec = AwaitTasks::spec_from_data("nat_task_ids");
        assert_eq!(spec.payload, json!({ "data_key": "nat_task_ids" }));

        let spec = AwaitResourceSync::spec(&["rtr-1".to_string()]);
        assert_eq!(spec.name, "await.resource_sync");
        assert_eq!(spec.payload, json!({ "resource_ids": ["rtr-1"] }));
    }
}
