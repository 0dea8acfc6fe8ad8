// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chain registry: which steps reconcile which resource kind.
//!
//! Resolved once at startup. Each [`ResourceKind`] may register a
//! [`ChainFactory`] for its create/update/delete syncs, plus any number of
//! named task chains (`power_off`, `associate_ip`, ...).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::chain::StepSpec;
use crate::error::{CoreError, Result};
use crate::persistence::ResourceRecord;
use crate::resource::ResourceKind;
use crate::task::TaskType;

/// Builds the sync chains for one resource kind.
pub trait ChainFactory: Send + Sync {
    /// Steps that materialise a new resource remotely.
    fn create_chain(&self, resource: &ResourceRecord) -> Vec<StepSpec>;

    /// Steps that reconcile a changed resource. Defaults to the create chain,
    /// since remote deploys are idempotent upserts.
    fn update_chain(&self, resource: &ResourceRecord) -> Vec<StepSpec> {
        self.create_chain(resource)
    }

    /// Steps that tear the resource down remotely.
    fn delete_chain(&self, resource: &ResourceRecord) -> Vec<StepSpec>;
}

type TaskChainFn = dyn Fn(&ResourceRecord, &Value) -> Vec<StepSpec> + Send + Sync;

/// Chain factories by resource kind, and named task chains by
/// `(kind, name)`.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    factories: HashMap<ResourceKind, Arc<dyn ChainFactory>>,
    tasks: HashMap<(ResourceKind, String), Arc<TaskChainFn>>,
}

impl ChainRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the sync chain factory for `kind`.
    pub fn register(
        &mut self,
        kind: ResourceKind,
        factory: impl ChainFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: ResourceKind, factory: impl ChainFactory + 'static) -> Self {
        self.register(kind, factory);
        self
    }

    /// Register a named task chain for `kind`.
    pub fn register_task<F>(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        build: F,
    ) -> &mut Self
    where
        F: Fn(&ResourceRecord, &Value) -> Vec<StepSpec> + Send + Sync + 'static,
    {
        self.tasks.insert((kind, name.into()), Arc::new(build));
        self
    }

    /// Builder-style [`register_task`](Self::register_task).
    pub fn with_task<F>(mut self, kind: ResourceKind, name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&ResourceRecord, &Value) -> Vec<StepSpec> + Send + Sync + 'static,
    {
        self.register_task(kind, name, build);
        self
    }

    /// Sync chain for a mutation of `resource`. Kinds without a factory have
    /// no remote presence and get an empty chain.
    pub fn sync_chain(
        &self,
        resource: &ResourceRecord,
        task_type: TaskType,
    ) -> Result<Vec<StepSpec>> {
        let kind = resource.resource_kind()?;
        let Some(factory) = self.factories.get(&kind) else {
            return Ok(Vec::new());
        };

        Ok(match task_type {
            TaskType::Create => factory.create_chain(resource),
            TaskType::Update => factory.update_chain(resource),
            TaskType::Delete => factory.delete_chain(resource),
        })
    }

    /// Chain for the named task on `resource`.
    pub fn named_chain(
        &self,
        resource: &ResourceRecord,
        name: &str,
        data: &Value,
    ) -> Result<Vec<StepSpec>> {
        let kind = resource.resource_kind()?;
        let build = self
            .tasks
            .get(&(kind, name.to_string()))
            .ok_or_else(|| CoreError::ValidationError {
                field: "name".to_string(),
                message: format!("no task '{}' registered for {}", name, kind),
            })?;

        Ok(build(resource, data))
    }

    /// True when `kind` has a sync chain factory.
    pub fn has_factory(&self, kind: ResourceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// True when `kind` has a task named `name`.
    pub fn has_task(&self, kind: ResourceKind, name: &str) -> bool {
        self.tasks.contains_key(&(kind, name.to_string()))
    }
}

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        let mut tasks: Vec<_> = self.tasks.keys().collect();
        tasks.sort();
        f.debug_struct("ChainRegistry")
            .field("factories", &kinds)
            .field("tasks", &tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RouterChains;

    impl ChainFactory for RouterChains {
        fn create_chain(&self, _resource: &ResourceRecord) -> Vec<StepSpec> {
            vec![StepSpec::new("deploy"), StepSpec::new("deploy_locale")]
        }

        fn delete_chain(&self, _resource: &ResourceRecord) -> Vec<StepSpec> {
            vec![StepSpec::new("undeploy")]
        }
    }

    fn names(steps: Vec<StepSpec>) -> Vec<String> {
        steps.into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn test_sync_chain_by_type() {
        let registry = ChainRegistry::new().with(ResourceKind::Router, RouterChains);
        let router = ResourceRecord::new(ResourceKind::Router, json!({}));

        assert_eq!(
            names(registry.sync_chain(&router, TaskType::Create).unwrap()),
            vec!["deploy", "deploy_locale"]
        );
        // Update falls back to the create chain.
        assert_eq!(
            names(registry.sync_chain(&router, TaskType::Update).unwrap()),
            vec!["deploy", "deploy_locale"]
        );
        assert_eq!(
            names(registry.sync_chain(&router, TaskType::Delete).unwrap()),
            vec!["undeploy"]
        );
    }

    #[test]
    fn test_kind_without_factory_has_empty_chain() {
        let registry = ChainRegistry::new().with(ResourceKind::Router, RouterChains);
        let vpc = ResourceRecord::new(ResourceKind::Vpc, json!({}));

        assert!(registry.sync_chain(&vpc, TaskType::Create).unwrap().is_empty());
        assert!(!registry.has_factory(ResourceKind::Vpc));
    }

    #[test]
    fn test_named_task_chain() {
        let registry = ChainRegistry::new().with_task(
            ResourceKind::Instance,
            "power_off",
            |resource, data| {
                vec![StepSpec::new("power_off").with_payload(json!({
                    "instance_id": resource.id,
                    "force": data.get("force").cloned().unwrap_or(json!(false)),
                }))]
            },
        );
        let instance = ResourceRecord::new(ResourceKind::Instance, json!({}));

        let steps = registry
            .named_chain(&instance, "power_off", &json!({ "force": true }))
            .unwrap();
        assert_eq!(steps[0].payload["force"], json!(true));
        assert!(registry.has_task(ResourceKind::Instance, "power_off"));

        let err = registry
            .named_chain(&instance, "reboot", &json!({}))
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
