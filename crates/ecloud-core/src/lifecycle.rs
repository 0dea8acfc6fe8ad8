// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle dispatch: reactions to resource create/save/delete moments.
//!
//! Saving a resource runs, in order:
//!
//! ```text
//! new:      Saving -> Creating -> insert -> Created -> Saved
//! existing: Saving -> update -> Saved
//! ```
//!
//! and deleting runs `Deleting -> remove -> Deleted`. Reactions are
//! registered per [`ResourceKind`] (or for all kinds) in a [`HookRegistry`]
//! built at startup, and run in registration order.
//!
//! Deletion is two-phase. The [`SyncOnDelete`] reaction vetoes the first
//! request, opens a delete unit of work and starts the teardown chain; when
//! that chain completes, the worker calls
//! [`ResourceLifecycle::finalize_delete`], which runs `Deleting` again, is
//! let through, and removes the local record.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::chain::{ChainExecutor, StepRegistry};
use crate::config::LockSettings;
use crate::error::{CoreError, Result};
use crate::lock::LockManager;
use crate::persistence::{Persistence, ResourceRecord, TaskRecord};
use crate::registry::ChainRegistry;
use crate::resource::ResourceKind;
use crate::sync::{DeleteGate, ResourceSync};
use crate::task::{TaskStatus, TaskType};

/// Moments in a resource's persistence lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Before a new resource is inserted.
    Creating,
    /// After a new resource is inserted.
    Created,
    /// Before any save (new or existing).
    Saving,
    /// After any save.
    Saved,
    /// Before a resource is removed. A veto keeps it.
    Deleting,
    /// After a resource is removed.
    Deleted,
}

/// What a reaction wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Run the remaining reactions and the operation.
    Continue,
    /// Stop here; the operation does not happen (yet).
    Veto,
}

/// State a reaction can read and change.
pub struct HookContext<'a> {
    /// The moment being dispatched.
    pub event: LifecycleEvent,
    /// The resource being saved or deleted.
    pub resource: &'a mut ResourceRecord,
    /// True when the resource has not been inserted yet.
    pub is_new: bool,
    /// Unit of work opened for this operation, if any.
    pub task: Option<TaskRecord>,
    /// Capability contract.
    pub sync: &'a ResourceSync,
    /// Chain executor.
    pub executor: &'a ChainExecutor,
    /// Chain factories.
    pub chains: &'a ChainRegistry,
}

/// A side effect of a lifecycle moment.
#[async_trait]
pub trait Reaction: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// React to the moment. Returning an error aborts the operation.
    async fn handle(&self, ctx: &mut HookContext<'_>) -> Result<HookOutcome>;
}

/// Reactions by resource kind and lifecycle moment.
#[derive(Clone, Default)]
pub struct HookRegistry {
    all_kinds: HashMap<LifecycleEvent, Vec<Arc<dyn Reaction>>>,
    by_kind: HashMap<(ResourceKind, LifecycleEvent), Vec<Arc<dyn Reaction>>>,
}

impl HookRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// React to `event` on resources of `kind`.
    pub fn on(
        mut self,
        kind: ResourceKind,
        event: LifecycleEvent,
        reaction: impl Reaction + 'static,
    ) -> Self {
        self.by_kind
            .entry((kind, event))
            .or_default()
            .push(Arc::new(reaction));
        self
    }

    /// React to `event` on every resource kind. These run before per-kind
    /// reactions.
    pub fn on_all(mut self, event: LifecycleEvent, reaction: impl Reaction + 'static) -> Self {
        self.all_kinds
            .entry(event)
            .or_default()
            .push(Arc::new(reaction));
        self
    }

    /// Make `kind` syncable: saves open create/update units of work and
    /// start their chains, deletes go through the two-phase teardown.
    pub fn with_sync(self, kind: ResourceKind) -> Self {
        self.on(kind, LifecycleEvent::Saving, SyncOnSave)
            .on(kind, LifecycleEvent::Saved, DispatchSyncChain)
            .on(kind, LifecycleEvent::Deleting, SyncOnDelete)
    }

    /// Reactions for `event` on `kind`, in dispatch order.
    pub fn handlers(&self, kind: ResourceKind, event: LifecycleEvent) -> Vec<Arc<dyn Reaction>> {
        self.all_kinds
            .get(&event)
            .into_iter()
            .chain(self.by_kind.get(&(kind, event)))
            .flatten()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("all_kinds", &self.all_kinds.len())
            .field("by_kind", &self.by_kind.len())
            .finish()
    }
}

/// Opens the create/update unit of work before a save. A busy resource
/// aborts the save.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOnSave;

#[async_trait]
impl Reaction for SyncOnSave {
    fn name(&self) -> &'static str {
        "sync_on_save"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> Result<HookOutcome> {
        let task_type = if ctx.is_new {
            TaskType::Create
        } else {
            TaskType::Update
        };
        let task = ctx.sync.begin_mutation(&ctx.resource.id, task_type).await?;
        ctx.task = Some(task);
        Ok(HookOutcome::Continue)
    }
}

/// Starts the sync chain for the unit of work opened by [`SyncOnSave`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSyncChain;

#[async_trait]
impl Reaction for DispatchSyncChain {
    fn name(&self) -> &'static str {
        "dispatch_sync_chain"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> Result<HookOutcome> {
        let Some(task) = ctx.task.as_ref() else {
            return Ok(HookOutcome::Continue);
        };
        if task.status() != TaskStatus::InProgress {
            return Ok(HookOutcome::Continue);
        }

        let task_type = task.task_type().unwrap_or(TaskType::Update);
        let steps = ctx.chains.sync_chain(ctx.resource, task_type)?;
        ctx.executor.start(&task.id, steps).await?;
        Ok(HookOutcome::Continue)
    }
}

/// Two-phase delete gate: lets the delete through once remote teardown has
/// completed, otherwise opens a delete unit of work, starts the teardown
/// chain and vetoes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOnDelete;

#[async_trait]
impl Reaction for SyncOnDelete {
    fn name(&self) -> &'static str {
        "sync_on_delete"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> Result<HookOutcome> {
        match ctx.sync.begin_delete(&ctx.resource.id).await? {
            DeleteGate::Proceed => Ok(HookOutcome::Continue),
            DeleteGate::Pending(task) => {
                let steps = ctx.chains.sync_chain(ctx.resource, TaskType::Delete)?;
                let task = *task;
                let task_id = task.id.clone();
                ctx.task = Some(task);
                ctx.executor.start(&task_id, steps).await?;
                Ok(HookOutcome::Veto)
            }
        }
    }
}

/// Refuses to save a child while its parent cannot be updated. The parent ID
/// is read from the child's `parent_key` property; the check runs under the
/// parent's sync lock.
///
/// Register it before [`HookRegistry::with_sync`] so a refused save opens no
/// unit of work.
#[derive(Debug, Clone, Copy)]
pub struct ParentSyncGate {
    parent_key: &'static str,
}

impl ParentSyncGate {
    /// Gate on the resource named by the `parent_key` property.
    pub fn new(parent_key: &'static str) -> Self {
        Self { parent_key }
    }
}

#[async_trait]
impl Reaction for ParentSyncGate {
    fn name(&self) -> &'static str {
        "parent_sync_gate"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> Result<HookOutcome> {
        let parent_id = ctx
            .resource
            .property_str(self.parent_key)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CoreError::ValidationError {
                field: self.parent_key.to_string(),
                message: format!("'{}' is required", self.parent_key),
            })?;

        let sync = ctx.sync;
        let blocker = sync
            .with_lock(&parent_id, || async {
                if sync.persistence().get_resource(&parent_id).await?.is_none() {
                    return Err(CoreError::ValidationError {
                        field: self.parent_key.to_string(),
                        message: format!("resource '{}' not found", parent_id),
                    });
                }
                sync.mutation_blocker(&parent_id, TaskType::Update).await
            })
            .await?;

        match blocker {
            None => Ok(HookOutcome::Continue),
            Some(reason) => {
                debug!(
                    resource_id = %ctx.resource.id,
                    parent_id = %parent_id,
                    "Parent cannot sync"
                );
                Err(CoreError::ResourceBusy {
                    resource_id: parent_id,
                    reason,
                })
            }
        }
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The local record was removed.
    Deleted,
    /// Teardown is running under this unit of work; the record stays until
    /// it completes.
    Pending(Box<TaskRecord>),
    /// A reaction refused the delete without opening a unit of work.
    Refused {
        /// The refusing reaction.
        reaction: &'static str,
    },
}

/// Runs saves and deletes through the lifecycle reactions.
pub struct ResourceLifecycle {
    persistence: Arc<dyn Persistence>,
    sync: Arc<ResourceSync>,
    executor: ChainExecutor,
    chains: Arc<ChainRegistry>,
    hooks: Arc<HookRegistry>,
}

impl ResourceLifecycle {
    /// Wire the engine together.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        locks: Arc<dyn LockManager>,
        lock_settings: LockSettings,
        steps: StepRegistry,
        chains: ChainRegistry,
        hooks: HookRegistry,
    ) -> Self {
        let sync = Arc::new(ResourceSync::new(
            persistence.clone(),
            locks,
            lock_settings,
        ));
        let chains = Arc::new(chains);
        let executor = ChainExecutor::new(
            persistence.clone(),
            sync.clone(),
            Arc::new(steps),
            chains.clone(),
        );

        Self {
            persistence,
            sync,
            executor,
            chains,
            hooks: Arc::new(hooks),
        }
    }

    /// Storage.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Capability contract.
    pub fn sync(&self) -> &ResourceSync {
        &self.sync
    }

    /// Chain executor.
    pub fn executor(&self) -> &ChainExecutor {
        &self.executor
    }

    /// Chain factories.
    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Load a resource or fail with `ResourceNotFound`.
    pub async fn load(&self, resource_id: &str) -> Result<ResourceRecord> {
        self.persistence
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CoreError::ResourceNotFound {
                resource_id: resource_id.to_string(),
            })
    }

    /// Insert or update `resource`, dispatching its lifecycle reactions.
    /// Returns the unit of work opened for the save, if the kind is synced.
    #[instrument(skip(self, resource), fields(resource_id = %resource.id, kind = %resource.kind))]
    pub async fn save(&self, resource: &mut ResourceRecord) -> Result<Option<TaskRecord>> {
        let kind = resource.resource_kind()?;
        let is_new = self.persistence.get_resource(&resource.id).await?.is_none();

        let mut ctx = HookContext {
            event: LifecycleEvent::Saving,
            resource,
            is_new,
            task: None,
            sync: &self.sync,
            executor: &self.executor,
            chains: &self.chains,
        };

        match self.run_save(kind, &mut ctx).await {
            Ok(()) => Ok(ctx.task),
            Err(e) => {
                if let Some(task) = &ctx.task {
                    let reason = format!("Save aborted: {}", e);
                    if let Err(fail_err) = self.sync.fail_mutation(&task.id, &reason).await {
                        error!(
                            task_id = %task.id,
                            error = %fail_err,
                            "Failed to fail orphaned task"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_save(&self, kind: ResourceKind, ctx: &mut HookContext<'_>) -> Result<()> {
        self.dispatch_or_refuse(kind, LifecycleEvent::Saving, ctx)
            .await?;

        if ctx.is_new {
            self.dispatch_or_refuse(kind, LifecycleEvent::Creating, ctx)
                .await?;
            self.persistence.insert_resource(ctx.resource).await?;
            info!(resource_id = %ctx.resource.id, "Resource created");
            self.dispatch(kind, LifecycleEvent::Created, ctx).await?;
        } else {
            self.persistence.update_resource(ctx.resource).await?;
            debug!(resource_id = %ctx.resource.id, "Resource updated");
        }

        self.dispatch(kind, LifecycleEvent::Saved, ctx).await?;
        Ok(())
    }

    /// Request deletion. Synced kinds return `Pending` until their teardown
    /// chain completes.
    #[instrument(skip(self))]
    pub async fn delete(&self, resource_id: &str) -> Result<DeleteOutcome> {
        let mut resource = self.load(resource_id).await?;

        match self.run_delete(&mut resource).await? {
            // An empty teardown chain completes on the spot.
            DeleteOutcome::Pending(task) if task.status() == TaskStatus::Complete => {
                self.run_delete(&mut resource).await
            }
            outcome => Ok(outcome),
        }
    }

    /// Second phase of a delete, called once a delete chain has completed.
    pub async fn finalize_delete(&self, task: &TaskRecord) -> Result<DeleteOutcome> {
        if task.task_type() != Some(TaskType::Delete) {
            return Err(CoreError::ValidationError {
                field: "task_type".to_string(),
                message: format!("task '{}' is not a delete", task.id),
            });
        }

        let Some(mut resource) = self.persistence.get_resource(&task.resource_id).await? else {
            debug!(resource_id = %task.resource_id, "Resource already removed");
            return Ok(DeleteOutcome::Deleted);
        };

        self.run_delete(&mut resource).await
    }

    async fn run_delete(&self, resource: &mut ResourceRecord) -> Result<DeleteOutcome> {
        let kind = resource.resource_kind()?;
        let mut ctx = HookContext {
            event: LifecycleEvent::Deleting,
            resource,
            is_new: false,
            task: None,
            sync: &self.sync,
            executor: &self.executor,
            chains: &self.chains,
        };

        if let Some(reaction) = self.dispatch(kind, LifecycleEvent::Deleting, &mut ctx).await? {
            return match ctx.task.take() {
                Some(task) => {
                    // Reload: starting an empty chain completes the task.
                    let task = self
                        .persistence
                        .get_task(&task.id)
                        .await?
                        .unwrap_or(task);
                    info!(
                        resource_id = %ctx.resource.id,
                        task_id = %task.id,
                        "Delete pending teardown"
                    );
                    Ok(DeleteOutcome::Pending(Box::new(task)))
                }
                None => Ok(DeleteOutcome::Refused { reaction }),
            };
        }

        self.persistence.delete_resource(&ctx.resource.id).await?;
        info!(resource_id = %ctx.resource.id, "Resource deleted");
        self.dispatch(kind, LifecycleEvent::Deleted, &mut ctx).await?;

        Ok(DeleteOutcome::Deleted)
    }

    /// Run a named task (`power_off`, ...) against a resource.
    #[instrument(skip(self, data))]
    pub async fn run_task(&self, resource_id: &str, name: &str, data: Value) -> Result<TaskRecord> {
        let resource = self.load(resource_id).await?;
        let steps = self.chains.named_chain(&resource, name, &data)?;

        let task = self
            .sync
            .begin_task(resource_id, name, TaskType::Update, data)
            .await?;
        self.executor.start(&task.id, steps).await?;

        Ok(task)
    }

    /// Re-run the update chain even if the resource is locked out after a
    /// failed create.
    #[instrument(skip(self))]
    pub async fn resync(&self, resource_id: &str) -> Result<TaskRecord> {
        let resource = self.load(resource_id).await?;
        let steps = self.chains.sync_chain(&resource, TaskType::Update)?;

        let task = self
            .sync
            .force_mutation(resource_id, TaskType::Update)
            .await?;
        self.executor.start(&task.id, steps).await?;

        Ok(task)
    }

    /// Dispatch and return the name of the vetoing reaction, if any.
    async fn dispatch(
        &self,
        kind: ResourceKind,
        event: LifecycleEvent,
        ctx: &mut HookContext<'_>,
    ) -> Result<Option<&'static str>> {
        ctx.event = event;
        for reaction in self.hooks.handlers(kind, event) {
            debug!(
                reaction = reaction.name(),
                ?event,
                resource_id = %ctx.resource.id,
                "Dispatching"
            );
            if reaction.handle(ctx).await? == HookOutcome::Veto {
                debug!(reaction = reaction.name(), ?event, "Vetoed");
                return Ok(Some(reaction.name()));
            }
        }
        Ok(None)
    }

    async fn dispatch_or_refuse(
        &self,
        kind: ResourceKind,
        event: LifecycleEvent,
        ctx: &mut HookContext<'_>,
    ) -> Result<()> {
        match self.dispatch(kind, event, ctx).await? {
            Some(reaction) => Err(CoreError::ValidationError {
                field: "resource".to_string(),
                message: format!("save refused by {}", reaction),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ResourceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLifecycle")
            .field("chains", &self.chains)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
