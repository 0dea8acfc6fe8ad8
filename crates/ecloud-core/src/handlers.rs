// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller boundary.
//!
//! Thin handlers an HTTP layer calls into. Each one returns a serialisable
//! view or an [`ApiError`] carrying the status the controller should reply
//! with: mutations answer 202 with the task to poll, a busy resource 409.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::error::{ApiError, CoreError};
use crate::lifecycle::{DeleteOutcome, ResourceLifecycle};
use crate::persistence::{ResourceRecord, TaskRecord};
use crate::task::SyncStatus;

/// Largest page `handle_list_tasks` returns.
pub const MAX_PER_PAGE: i64 = 100;

/// Body of a 202 response to a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationAccepted {
    /// Resource being mutated.
    pub resource_id: String,
    /// Unit of work to poll; absent when nothing remote had to happen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Public view of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    /// Task ID.
    pub id: String,
    /// Owning resource.
    pub resource_id: String,
    /// Owning resource kind.
    pub resource_type: String,
    /// Task name.
    pub name: String,
    /// `create`, `update` or `delete`.
    #[serde(rename = "type")]
    pub task_type: String,
    /// `in-progress`, `complete` or `failed`.
    pub status: String,
    /// Why the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Last changed.
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskView {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: task.id.clone(),
            resource_id: task.resource_id.clone(),
            resource_type: task.resource_type.clone(),
            name: task.name.clone(),
            task_type: task.task_type.clone(),
            status: task.status.clone(),
            failure_reason: task.failure_reason.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// One page of a resource's tasks, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    /// Tasks on this page.
    pub data: Vec<TaskView>,
    /// Tasks across all pages.
    pub total: i64,
    /// 1-based page number.
    pub page: i64,
    /// Page size.
    pub per_page: i64,
}

fn api_error(err: CoreError) -> ApiError {
    let api = err.to_api_error();
    if api.status >= 500 {
        error!(error = %err, code = api.code, "Request failed");
    }
    api
}

/// Create or update a resource. Synced kinds answer with the task that
/// reconciles it.
#[instrument(skip(lifecycle, resource), fields(resource_id = %resource.id))]
pub async fn handle_save(
    lifecycle: &ResourceLifecycle,
    mut resource: ResourceRecord,
) -> Result<MutationAccepted, ApiError> {
    let task = lifecycle.save(&mut resource).await.map_err(api_error)?;

    Ok(MutationAccepted {
        resource_id: resource.id,
        task_id: task.map(|t| t.id),
    })
}

/// Delete a resource. Synced kinds answer with the teardown task; the
/// record disappears once it completes.
#[instrument(skip(lifecycle))]
pub async fn handle_delete(
    lifecycle: &ResourceLifecycle,
    resource_id: &str,
) -> Result<MutationAccepted, ApiError> {
    match lifecycle.delete(resource_id).await.map_err(api_error)? {
        DeleteOutcome::Deleted => Ok(MutationAccepted {
            resource_id: resource_id.to_string(),
            task_id: None,
        }),
        DeleteOutcome::Pending(task) => Ok(MutationAccepted {
            resource_id: resource_id.to_string(),
            task_id: Some(task.id),
        }),
        DeleteOutcome::Refused { reaction } => {
            info!(reaction, "Delete refused");
            Err(api_error(CoreError::ValidationError {
                field: "resource_id".to_string(),
                message: format!("resource '{}' cannot be deleted", resource_id),
            }))
        }
    }
}

/// Run a named task such as `power_off`.
#[instrument(skip(lifecycle, data))]
pub async fn handle_run_task(
    lifecycle: &ResourceLifecycle,
    resource_id: &str,
    name: &str,
    data: Value,
) -> Result<MutationAccepted, ApiError> {
    let task = lifecycle
        .run_task(resource_id, name, data)
        .await
        .map_err(api_error)?;

    Ok(MutationAccepted {
        resource_id: resource_id.to_string(),
        task_id: Some(task.id),
    })
}

/// Fetch one task.
#[instrument(skip(lifecycle))]
pub async fn handle_get_task(
    lifecycle: &ResourceLifecycle,
    task_id: &str,
) -> Result<TaskView, ApiError> {
    lifecycle
        .persistence()
        .get_task(task_id)
        .await
        .map_err(api_error)?
        .map(|task| TaskView::from(&task))
        .ok_or_else(|| {
            api_error(CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })
        })
}

/// List a resource's tasks, newest first.
#[instrument(skip(lifecycle))]
pub async fn handle_list_tasks(
    lifecycle: &ResourceLifecycle,
    resource_id: &str,
    page: i64,
    per_page: i64,
) -> Result<TaskPage, ApiError> {
    if page < 1 {
        return Err(api_error(CoreError::ValidationError {
            field: "page".to_string(),
            message: "must be at least 1".to_string(),
        }));
    }
    if !(1..=MAX_PER_PAGE).contains(&per_page) {
        return Err(api_error(CoreError::ValidationError {
            field: "per_page".to_string(),
            message: format!("must be between 1 and {}", MAX_PER_PAGE),
        }));
    }

    let persistence = lifecycle.persistence();
    if persistence
        .get_resource(resource_id)
        .await
        .map_err(api_error)?
        .is_none()
    {
        return Err(api_error(CoreError::ResourceNotFound {
            resource_id: resource_id.to_string(),
        }));
    }

    let total = persistence
        .count_tasks(resource_id)
        .await
        .map_err(api_error)?;
    let tasks = persistence
        .list_tasks(resource_id, per_page, (page - 1) * per_page)
        .await
        .map_err(api_error)?;

    Ok(TaskPage {
        data: tasks.iter().map(TaskView::from).collect(),
        total,
        page,
        per_page,
    })
}

/// Current sync status of a resource.
#[instrument(skip(lifecycle))]
pub async fn handle_resource_sync(
    lifecycle: &ResourceLifecycle,
    resource_id: &str,
) -> Result<SyncStatus, ApiError> {
    lifecycle.load(resource_id).await.map_err(api_error)?;
    lifecycle
        .sync()
        .current_status(resource_id)
        .await
        .map_err(api_error)
}
