//! Persistence interfaces and backends for ecloud-core.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;

use crate::chain::StepSpec;
use crate::error::CoreError;
use crate::resource::ResourceKind;

/// Resource record from the persistence layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ResourceRecord {
    /// Prefixed resource identifier (`rtr-0a1b2c3d`).
    pub id: String,
    /// Kind tag (`router`, `network`, ...).
    pub kind: String,
    /// Display name.
    pub name: Option<String>,
    /// Kind-specific fields as a JSON object.
    pub properties: Json<Value>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last saved.
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Build a new, unsaved resource of the given kind with a fresh ID.
    pub fn new(kind: ResourceKind, properties: Value) -> Self {
        let now = Utc::now();
        let properties = match properties {
            Value::Object(_) => properties,
            _ => Value::Object(Map::new()),
        };
        Self {
            id: kind.generate_id(),
            kind: kind.as_str().to_string(),
            name: None,
            properties: Json(properties),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Typed kind.
    pub fn resource_kind(&self) -> Result<ResourceKind, CoreError> {
        ResourceKind::parse(&self.kind).ok_or_else(|| CoreError::ValidationError {
            field: "kind".to_string(),
            message: format!("unknown resource kind '{}'", self.kind),
        })
    }

    /// Read a property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.0.get(key)
    }

    /// Read a string property.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Value::as_str)
    }

    /// Set a property, replacing any previous value.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        if !self.properties.0.is_object() {
            self.properties.0 = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.properties.0 {
            map.insert(key.into(), value);
        }
    }
}

/// Unit of work (task) record from the persistence layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskRecord {
    /// Unique identifier (`task-0a1b2c3d`).
    pub id: String,
    /// Resource this unit of work mutates.
    pub resource_id: String,
    /// Kind tag of the resource.
    pub resource_type: String,
    /// Operation name (`sync_create`, `power_off`, ...).
    pub name: String,
    /// Mutation kind (create, update, delete).
    pub task_type: String,
    /// Current status (in-progress, complete, failed).
    pub status: String,
    /// Reason for failure; set only when failed.
    pub failure_reason: Option<String>,
    /// Step-to-step data bag.
    pub data: Json<Value>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last changed.
    pub updated_at: DateTime<Utc>,
}

/// A queued chain step from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Database primary key.
    pub id: i64,
    /// Task the chain belongs to.
    pub task_id: String,
    /// The full chain.
    pub steps: Json<Vec<StepSpec>>,
    /// Index into `steps` of the step this job runs.
    pub position: i32,
    /// Number of times this step has released so far.
    pub attempts: i32,
    /// Earliest time the job may be delivered.
    pub available_at: DateTime<Utc>,
    /// Worker lease; the job is redelivered once this passes.
    pub locked_until: Option<DateTime<Utc>>,
    /// Set by each claim. Every later transition must present it, so a
    /// worker whose lease lapsed cannot act on a job claimed by another.
    pub claim_token: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// The step this job runs, if the position is in range.
    pub fn current_step(&self) -> Option<&StepSpec> {
        usize::try_from(self.position)
            .ok()
            .and_then(|position| self.steps.0.get(position))
    }

    /// True when this job runs the final step of its chain.
    pub fn is_last_step(&self) -> bool {
        usize::try_from(self.position + 1).is_ok_and(|next| next >= self.steps.0.len())
    }
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Task the chain belongs to.
    pub task_id: String,
    /// The full chain.
    pub steps: Vec<StepSpec>,
    /// Index of the step to run.
    pub position: i32,
    /// Earliest delivery time.
    pub available_at: DateTime<Utc>,
}

/// Check a task data bag key. Keys are ASCII letters, digits, `_` or `-`.
pub fn check_data_key(key: &str) -> Result<(), CoreError> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(CoreError::ValidationError {
            field: "data_key".to_string(),
            message: format!("'{}' is not a valid task data key", key),
        })
    }
}

/// Storage for resources, units of work and the chain job queue.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<(), CoreError>;

    async fn get_resource(&self, resource_id: &str) -> Result<Option<ResourceRecord>, CoreError>;

    /// Persist name and properties; fails with `ResourceNotFound` if absent.
    async fn update_resource(&self, resource: &ResourceRecord) -> Result<(), CoreError>;

    /// Returns whether a row was removed.
    async fn delete_resource(&self, resource_id: &str) -> Result<bool, CoreError>;

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// Newest task for the resource (by creation time, then insertion order).
    async fn latest_task(&self, resource_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    async fn count_tasks(&self, resource_id: &str) -> Result<i64, CoreError>;

    /// Tasks for the resource, newest first.
    async fn list_tasks(
        &self,
        resource_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    /// `in-progress -> complete`. Returns false when the task was not in progress.
    async fn complete_task(&self, task_id: &str) -> Result<bool, CoreError>;

    /// `in-progress | failed -> failed` with the given reason. Returns false
    /// when the task is complete or missing.
    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool, CoreError>;

    /// Set `data[key] = value` on the task. `key` must pass
    /// [`check_data_key`].
    async fn merge_task_data(
        &self,
        task_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), CoreError>;

    async fn enqueue_job(&self, job: &NewJob) -> Result<i64, CoreError>;

    /// Lease up to `limit` jobs that are due and not leased by another worker.
    /// Each call stamps its jobs with a fresh claim token.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError>;

    /// Extend the lease of a claimed job. Returns false when the claim is no
    /// longer held.
    async fn renew_job_lease(
        &self,
        job: &JobRecord,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Remove the claimed job and, in the same transaction, enqueue its
    /// successor. Returns false, enqueuing nothing, when the claim is no
    /// longer held.
    async fn advance_job(
        &self,
        job: &JobRecord,
        next: Option<&NewJob>,
    ) -> Result<bool, CoreError>;

    /// Record a release and make the job deliverable again at `available_at`.
    /// Returns false when the claim is no longer held.
    async fn release_job(
        &self,
        job: &JobRecord,
        attempts: i32,
        available_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Remove the claimed job. Returns false when the claim is no longer held.
    async fn delete_job(&self, job: &JobRecord) -> Result<bool, CoreError>;

    async fn count_jobs(&self, task_id: &str) -> Result<i64, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
