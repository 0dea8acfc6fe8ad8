// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ecloud-core integration tests.
//!
//! Provides TestContext over an in-memory SQLite database, plus scripted
//! steps whose outcomes the tests control.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use ecloud_core::chain::{Step, StepContext, StepError, StepOutcome, StepRegistry, StepSpec};
use ecloud_core::config::LockSettings;
use ecloud_core::lifecycle::{HookRegistry, ResourceLifecycle};
use ecloud_core::lock::{InMemoryLockManager, LockManager};
use ecloud_core::persistence::{Persistence, ResourceRecord, SqlitePersistence};
use ecloud_core::registry::{ChainFactory, ChainRegistry};
use ecloud_core::resource::ResourceKind;
use ecloud_core::worker::{Worker, WorkerConfig};

/// Ordered log of step executions: `"<label>@<resource_id>"`.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.split('@').next().unwrap_or_default().to_string())
            .collect()
    }
}

/// Succeeds, recording `payload.label`.
pub struct RecordStep {
    pub recorder: Recorder,
}

impl RecordStep {
    pub const NAME: &'static str = "test.record";

    pub fn spec(label: &str) -> StepSpec {
        StepSpec::new(Self::NAME).with_payload(json!({ "label": label }))
    }
}

#[async_trait]
impl Step for RecordStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let label = ctx.spec().payload["label"].as_str().unwrap_or("?").to_string();
        self.recorder.push(format!("{}@{}", label, ctx.resource_id()));
        Ok(StepOutcome::Success)
    }
}

/// Releases every time, counting executions per task.
#[derive(Default)]
pub struct ReleaseStep {
    pub executions: Arc<AtomicU32>,
}

impl ReleaseStep {
    pub const NAME: &'static str = "test.release";

    pub fn spec(max_attempts: u32) -> StepSpec {
        StepSpec::new(Self::NAME).polling(max_attempts, Duration::ZERO)
    }
}

#[async_trait]
impl Step for ReleaseStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.release())
    }
}

/// Fails with `payload.reason`.
pub struct FailStep;

impl FailStep {
    pub const NAME: &'static str = "test.fail";

    pub fn spec(reason: &str) -> StepSpec {
        StepSpec::new(Self::NAME).with_payload(json!({ "reason": reason }))
    }
}

#[async_trait]
impl Step for FailStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let reason = ctx.spec().payload["reason"]
            .as_str()
            .unwrap_or("failed")
            .to_string();
        Ok(StepOutcome::Fail(reason))
    }
}

/// Stores `payload.value` under `payload.key` in the task data bag.
pub struct PutDataStep;

impl PutDataStep {
    pub const NAME: &'static str = "test.put_data";

    pub fn spec(key: &str, value: Value) -> StepSpec {
        StepSpec::new(Self::NAME).with_payload(json!({ "key": key, "value": value }))
    }
}

#[async_trait]
impl Step for PutDataStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let key = ctx.spec().payload["key"]
            .as_str()
            .ok_or_else(|| StepError::failed("missing key"))?
            .to_string();
        ctx.put_data(&key, ctx.spec().payload["value"].clone())
            .await?;
        Ok(StepOutcome::Success)
    }
}

/// Starts teardown of `payload.resource_ids` and stores the opened task IDs
/// under `dependent_task_ids`.
pub struct DeleteDependentsStep;

impl DeleteDependentsStep {
    pub const NAME: &'static str = "test.delete_dependents";
    pub const DATA_KEY: &'static str = "dependent_task_ids";

    pub fn spec(resource_ids: &[String]) -> StepSpec {
        StepSpec::new(Self::NAME).with_payload(json!({ "resource_ids": resource_ids }))
    }
}

#[async_trait]
impl Step for DeleteDependentsStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let ids: Vec<String> = serde_json::from_value(ctx.spec().payload["resource_ids"].clone())
            .map_err(|e| StepError::failed(e.to_string()))?;
        let mut task_ids = Vec::new();
        for id in &ids {
            if let Some(task) = ctx.begin_dependent_delete(id).await? {
                task_ids.push(task.id);
            }
        }
        ctx.put_data(Self::DATA_KEY, json!(task_ids)).await?;
        Ok(StepOutcome::Success)
    }
}

/// Chains assembled per kind from fixed step lists.
#[derive(Clone, Default)]
pub struct ScriptedChains {
    pub create: Vec<StepSpec>,
    pub update: Option<Vec<StepSpec>>,
    pub delete: Vec<StepSpec>,
}

impl ChainFactory for ScriptedChains {
    fn create_chain(&self, _resource: &ResourceRecord) -> Vec<StepSpec> {
        self.create.clone()
    }

    fn update_chain(&self, _resource: &ResourceRecord) -> Vec<StepSpec> {
        self.update.clone().unwrap_or_else(|| self.create.clone())
    }

    fn delete_chain(&self, _resource: &ResourceRecord) -> Vec<StepSpec> {
        self.delete.clone()
    }
}

/// Test context wiring an in-memory engine.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub locks: Arc<InMemoryLockManager>,
    pub lifecycle: Arc<ResourceLifecycle>,
    pub worker: Worker,
    pub recorder: Recorder,
    pub release_executions: Arc<AtomicU32>,
}

impl TestContext {
    /// Engine where the given kinds are synced through scripted chains.
    pub async fn new(chains: HashMap<ResourceKind, ScriptedChains>) -> Self {
        Self::with_lock_settings(chains, test_lock_settings()).await
    }

    pub async fn with_lock_settings(
        chains: HashMap<ResourceKind, ScriptedChains>,
        lock_settings: LockSettings,
    ) -> Self {
        let mut registry = ChainRegistry::new();
        let mut hooks = HookRegistry::new();
        for (kind, factory) in chains {
            registry.register(kind, factory);
            hooks = hooks.with_sync(kind);
        }
        Self::build(registry, hooks, lock_settings).await
    }

    /// Engine over caller-built registries.
    pub async fn build(
        registry: ChainRegistry,
        hooks: HookRegistry,
        lock_settings: LockSettings,
    ) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory database"),
        );
        let locks = Arc::new(InMemoryLockManager::new());
        let recorder = Recorder::default();
        let release = ReleaseStep::default();
        let release_executions = release.executions.clone();

        let steps = StepRegistry::new()
            .with(RecordStep {
                recorder: recorder.clone(),
            })
            .with(release)
            .with(FailStep)
            .with(PutDataStep)
            .with(DeleteDependentsStep);

        let lifecycle = Arc::new(ResourceLifecycle::new(
            persistence.clone(),
            locks.clone() as Arc<dyn LockManager>,
            lock_settings,
            steps,
            registry,
            hooks,
        ));

        let worker = Worker::new(
            0,
            lifecycle.clone(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
                lease: Duration::from_secs(300),
            },
        );

        Self {
            persistence,
            locks,
            lifecycle,
            worker,
            recorder,
            release_executions,
        }
    }

    /// Run the queue until nothing is due. Returns jobs executed.
    pub async fn drain(&self) -> usize {
        let mut executed = 0;
        for _ in 0..500 {
            let claimed = self
                .worker
                .process_due_jobs()
                .await
                .expect("Failed to process due jobs");
            if claimed == 0 {
                return executed;
            }
            executed += claimed;
        }
        panic!("queue did not drain");
    }

    /// Save a new resource of `kind`.
    pub async fn create(&self, kind: ResourceKind, properties: Value) -> ResourceRecord {
        let mut resource = ResourceRecord::new(kind, properties);
        self.lifecycle
            .save(&mut resource)
            .await
            .expect("Failed to save resource");
        resource
    }
}

pub fn test_lock_settings() -> LockSettings {
    LockSettings {
        ttl: Duration::from_secs(5),
        max_wait: Duration::from_secs(10),
    }
}

pub fn chains(
    kind: ResourceKind,
    factory: ScriptedChains,
) -> HashMap<ResourceKind, ScriptedChains> {
    HashMap::from([(kind, factory)])
}
