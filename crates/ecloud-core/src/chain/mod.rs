// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job chains: ordered steps that reconcile one unit of work with remote
//! infrastructure.
//!
//! A chain is a `Vec<StepSpec>` bound to a task. The [`ChainExecutor`] runs
//! one step per queue delivery; each step reports a tri-state
//! [`StepOutcome`]:
//!
//! | Outcome | Effect |
//! |---------|--------|
//! | `Success` | next step is enqueued; after the last step the task completes |
//! | `Release(d)` | the same step is redelivered after `d`, until `max_attempts` |
//! | `Fail(reason)` | the task fails with `reason`; later steps never run |

pub mod await_steps;
pub mod executor;

pub use self::await_steps::{AwaitResourceSync, AwaitState, AwaitTasks};
pub use self::executor::{ChainExecutor, ChainHandle, JobResult};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::persistence::{Persistence, ResourceRecord, TaskRecord};
use crate::sync::{DeleteGate, ResourceSync};
use crate::task::TaskType;

/// Serialised description of one step in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registered step name.
    pub name: String,
    /// Step-specific parameters.
    #[serde(default)]
    pub payload: Value,
    /// Total executions allowed before a releasing step is failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before a released step is redelivered.
    #[serde(default)]
    pub backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl StepSpec {
    /// A single-shot step: any release fails the chain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            max_attempts: default_max_attempts(),
            backoff_secs: 0,
        }
    }

    /// Attach parameters.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Allow the step to release up to `max_attempts` executions, `backoff`
    /// apart.
    pub fn polling(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_secs = backoff.as_secs();
        self
    }

    /// Redelivery delay.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's work is done.
    Success,
    /// Not ready yet; run the same step again after the delay.
    Release(Duration),
    /// Permanent failure with a human-readable reason.
    Fail(String),
}

/// Error raised by a step. Always converted to [`StepOutcome::Fail`].
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Engine failure (database, missing record).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The step's payload did not match what it expects.
    #[error("invalid payload for step '{step}': {message}")]
    Payload {
        /// Step name.
        step: String,
        /// Decoder message.
        message: String,
    },

    /// Any other failure; the message becomes the task's failure reason.
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Failure with a custom message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A unit of remote (or local) work that can appear in a chain.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name under which the step is registered and serialised.
    fn name(&self) -> &'static str;

    /// Execute the step. Implementations re-read whatever state they depend
    /// on; the context carries the freshly loaded task.
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError>;
}

/// Everything a step may touch while running.
pub struct StepContext<'a> {
    task: TaskRecord,
    spec: &'a StepSpec,
    attempt: u32,
    executor: &'a ChainExecutor,
}

impl<'a> StepContext<'a> {
    /// Build a context. `attempt` is 1-based.
    pub fn new(
        task: TaskRecord,
        spec: &'a StepSpec,
        attempt: u32,
        executor: &'a ChainExecutor,
    ) -> Self {
        Self {
            task,
            spec,
            attempt,
            executor,
        }
    }

    /// The unit of work, as loaded just before the step ran.
    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    /// ID of the resource being mutated.
    pub fn resource_id(&self) -> &str {
        &self.task.resource_id
    }

    /// The step's serialised spec.
    pub fn spec(&self) -> &StepSpec {
        self.spec
    }

    /// Which execution of this step this is, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decode the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(self.spec.payload.clone()).map_err(|e| StepError::Payload {
            step: self.spec.name.clone(),
            message: e.to_string(),
        })
    }

    /// Release with the step's configured backoff.
    pub fn release(&self) -> StepOutcome {
        StepOutcome::Release(self.spec.backoff())
    }

    /// Value from the task's data bag.
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.task.data_value(key)
    }

    /// Store a value in the task's data bag for later steps. Keys are ASCII
    /// letters, digits, `_` or `-`.
    pub async fn put_data(&self, key: &str, value: Value) -> Result<(), StepError> {
        self.persistence()
            .merge_task_data(&self.task.id, key, &value)
            .await?;
        Ok(())
    }

    /// Load the resource being mutated.
    pub async fn resource(&self) -> Result<ResourceRecord, StepError> {
        self.persistence()
            .get_resource(&self.task.resource_id)
            .await?
            .ok_or_else(|| {
                StepError::Core(CoreError::ResourceNotFound {
                    resource_id: self.task.resource_id.clone(),
                })
            })
    }

    /// Persist fields learned from remote infrastructure. No lifecycle
    /// events are dispatched.
    pub async fn store_resource(&self, resource: &ResourceRecord) -> Result<(), StepError> {
        self.persistence().update_resource(resource).await?;
        Ok(())
    }

    /// Capability contract, for steps that gate on other resources.
    pub fn sync(&self) -> &ResourceSync {
        self.executor.sync()
    }

    /// Storage.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.executor.persistence()
    }

    /// Start remote teardown of another resource this one depends on, and
    /// return the delete unit of work to await.
    ///
    /// Returns `None` when the resource is already gone or its teardown has
    /// already completed. A kind with no teardown steps is removed locally on
    /// the spot. A dependent with a unit of work in flight is refused with
    /// `ResourceBusy`.
    pub async fn begin_dependent_delete(
        &self,
        resource_id: &str,
    ) -> Result<Option<TaskRecord>, StepError> {
        let Some(resource) = self.persistence().get_resource(resource_id).await? else {
            return Ok(None);
        };

        let task = match self.sync().begin_delete(resource_id).await? {
            DeleteGate::Proceed => return Ok(None),
            DeleteGate::Pending(task) => *task,
        };

        let steps = match self.executor.chains().sync_chain(&resource, TaskType::Delete) {
            Ok(steps) => steps,
            Err(e) => {
                self.sync().fail_mutation(&task.id, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let handle = self.executor.start(&task.id, steps).await?;
        if handle.steps == 0 {
            self.persistence().delete_resource(resource_id).await?;
            debug!(resource_id, "Dependent without teardown removed");
        }
        info!(
            resource_id,
            parent = %self.task.resource_id,
            task_id = %task.id,
            "Dependent teardown started"
        );

        Ok(Some(task))
    }
}

/// Step implementations by name. Built once at startup.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<&'static str, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Registry holding the built-in await steps.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(AwaitTasks);
        registry.register(AwaitResourceSync);
        registry
    }

    /// Register a step under its own name, replacing any previous one.
    pub fn register(&mut self, step: impl Step + 'static) -> &mut Self {
        let name = step.name();
        if self.steps.insert(name, Arc::new(step)).is_some() {
            warn!(step = name, "Step registered twice; keeping the latest");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, step: impl Step + 'static) -> Self {
        self.register(step);
        self
    }

    /// Look up a step.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.steps.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        fn name(&self) -> &'static str {
            "test.noop"
        }

        async fn run(&self, _ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Success)
        }
    }

    #[test]
    fn test_step_spec_defaults_to_single_attempt() {
        let spec = StepSpec::new("nsx.router.deploy");
        assert_eq!(spec.max_attempts, 1);
        assert_eq!(spec.backoff(), Duration::ZERO);

        let decoded: StepSpec = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert_eq!(decoded, StepSpec::new("x"));
    }

    #[test]
    fn test_polling_spec() {
        let spec = StepSpec::new("await.tasks")
            .with_payload(json!({ "task_ids": ["task-1"] }))
            .polling(60, Duration::from_secs(5));
        assert_eq!(spec.max_attempts, 60);
        assert_eq!(spec.backoff(), Duration::from_secs(5));

        // A zero budget still allows one execution.
        assert_eq!(StepSpec::new("x").polling(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_registry_includes_await_steps() {
        let registry = StepRegistry::new().with(Noop);
        assert_eq!(
            registry.names(),
            vec!["await.resource_sync", "await.tasks", "test.noop"]
        );
        assert!(registry.contains("test.noop"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_step_error_messages() {
        let err = StepError::failed("remote error: 500 boom");
        assert_eq!(err.to_string(), "remote error: 500 boom");

        let err = StepError::from(CoreError::ResourceNotFound {
            resource_id: "vol-1".to_string(),
        });
        assert_eq!(err.to_string(), "Resource 'vol-1' not found");
    }
}
