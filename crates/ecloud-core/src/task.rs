// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Units of work: task type, task status and derived resource sync status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::TaskRecord;
use crate::resource::generate_id;

/// Kind of mutation a unit of work represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// First materialisation of a resource on remote infrastructure.
    Create,
    /// Reconciliation of a changed resource.
    Update,
    /// Teardown of a resource.
    Delete,
}

impl TaskType {
    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse a type from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Default task name for a sync of this type (`sync_create`, ...).
    pub fn sync_name(&self) -> String {
        format!("sync_{}", self.as_str())
    }
}

/// Status of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Chain is still running.
    #[serde(rename = "in-progress")]
    InProgress,
    /// Every step of the chain succeeded.
    #[serde(rename = "complete")]
    Complete,
    /// A step failed or ran out of retries.
    #[serde(rename = "failed")]
    Failed,
}

impl TaskStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for `complete` and `failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Sync status of a resource, derived from its latest unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Status of the latest task.
    pub status: TaskStatus,
    /// Type of the latest task; `None` when the resource has no tasks.
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
}

impl SyncStatus {
    /// Status of a resource that has never been mutated.
    pub fn implicit_complete() -> Self {
        Self {
            status: TaskStatus::Complete,
            task_type: None,
        }
    }

    /// Derive the status from a task record.
    pub fn of(task: &TaskRecord) -> Self {
        Self {
            status: task.status(),
            task_type: task.task_type(),
        }
    }
}

/// Generate a new task ID.
pub fn generate_task_id() -> String {
    generate_id("task")
}

impl TaskRecord {
    /// Typed status. Unrecognised values are treated as failed so they block
    /// further mutation instead of silently unlocking the resource.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Failed)
    }

    /// Typed mutation kind.
    pub fn task_type(&self) -> Option<TaskType> {
        TaskType::parse(&self.task_type)
    }

    /// Read a key from the task's data bag.
    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.0.get(key)
    }

    /// Read a list of strings from the task's data bag; missing or non-list
    /// values yield an empty list.
    pub fn data_ids(&self, key: &str) -> Vec<String> {
        self.data_value(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::types::Json;

    fn record(status: &str, task_type: &str, data: Value) -> TaskRecord {
        TaskRecord {
            id: generate_task_id(),
            resource_id: "rtr-00000001".to_string(),
            resource_type: "router".to_string(),
            name: "sync_create".to_string(),
            task_type: task_type.to_string(),
            status: status.to_string(),
            failure_reason: None,
            data: Json(data),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [TaskStatus::InProgress, TaskStatus::Complete, TaskStatus::Failed] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::InProgress.as_str(), "in-progress");
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            json!("in-progress")
        );
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_unknown_status_is_treated_as_failed() {
        let task = record("exploded", "update", json!({}));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_sync_name() {
        assert_eq!(TaskType::Delete.sync_name(), "sync_delete");
        assert_eq!(TaskType::parse("create"), Some(TaskType::Create));
        assert_eq!(TaskType::parse("CREATE"), None);
    }

    #[test]
    fn test_data_ids() {
        let task = record(
            "in-progress",
            "create",
            json!({ "task_ids": ["task-1", "task-2", 7], "other": "x" }),
        );
        assert_eq!(task.data_ids("task_ids"), vec!["task-1", "task-2"]);
        assert!(task.data_ids("other").is_empty());
        assert!(task.data_ids("missing").is_empty());
    }

    #[test]
    fn test_sync_status_serialization() {
        let status = SyncStatus::implicit_complete();
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            json!({ "status": "complete", "type": null })
        );
    }
}
