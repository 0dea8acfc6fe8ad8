// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chain executor tests: ordering, release budget, failure and await gates.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{FailStep, PutDataStep, RecordStep, ReleaseStep, ScriptedChains, TestContext, chains};
use ecloud_core::chain::await_steps::await_resource_sync;
use ecloud_core::chain::{AwaitResourceSync, AwaitState, AwaitTasks, JobResult, StepSpec};
use ecloud_core::error::CoreError;
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::resource::ResourceKind;
use ecloud_core::task::{TaskStatus, TaskType};

fn router_chain(create: Vec<StepSpec>) -> HashMap<ResourceKind, ScriptedChains> {
    chains(
        ResourceKind::Router,
        ScriptedChains {
            create,
            update: None,
            delete: Vec::new(),
        },
    )
}

async fn latest_status(ctx: &TestContext, resource_id: &str) -> (TaskStatus, Option<String>) {
    let task = ctx
        .persistence
        .latest_task(resource_id)
        .await
        .unwrap()
        .expect("resource should have a task");
    (task.status(), task.failure_reason)
}

#[tokio::test]
async fn test_steps_run_in_order_and_complete_the_task() {
    let ctx = TestContext::new(router_chain(vec![
        RecordStep::spec("deploy"),
        RecordStep::spec("deploy_locale"),
        RecordStep::spec("default_firewall_rule"),
    ]))
    .await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    let (status, _) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::InProgress);

    assert_eq!(ctx.drain().await, 3);
    assert_eq!(
        ctx.recorder.labels(),
        vec!["deploy", "deploy_locale", "default_firewall_rule"]
    );

    let task = ctx.persistence.latest_task(&router.id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(ctx.persistence.count_jobs(&task.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_release_exhausts_after_exactly_max_attempts() {
    let ctx = TestContext::new(router_chain(vec![
        ReleaseStep::spec(3),
        RecordStep::spec("never"),
    ]))
    .await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    ctx.drain().await;

    assert_eq!(ctx.release_executions.load(Ordering::SeqCst), 3);
    assert!(ctx.recorder.entries().is_empty());

    let (status, reason) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        reason.as_deref(),
        Some("Step 'test.release' retries exhausted after 3 attempts")
    );
}

#[tokio::test]
async fn test_mutating_step_has_no_retry_budget() {
    let ctx = TestContext::new(router_chain(vec![StepSpec::new(ReleaseStep::NAME)])).await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    ctx.drain().await;

    assert_eq!(ctx.release_executions.load(Ordering::SeqCst), 1);
    let (status, _) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_failure_stops_chain_and_records_reason() {
    let ctx = TestContext::new(router_chain(vec![
        RecordStep::spec("deploy"),
        FailStep::spec("remote error: 500 Internal Server Error"),
        RecordStep::spec("deploy_locale"),
    ]))
    .await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    assert_eq!(ctx.drain().await, 2);

    assert_eq!(ctx.recorder.labels(), vec!["deploy"]);
    let (status, reason) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        reason.as_deref(),
        Some("remote error: 500 Internal Server Error")
    );
}

#[tokio::test]
async fn test_unknown_step_fails_task_at_start() {
    let ctx = TestContext::new(HashMap::new()).await;
    let router = ResourceRecord::new(ResourceKind::Router, json!({}));
    ctx.persistence.insert_resource(&router).await.unwrap();

    let task = ctx
        .lifecycle
        .sync()
        .begin_mutation(&router.id, TaskType::Update)
        .await
        .unwrap();
    let err = ctx
        .lifecycle
        .executor()
        .start(&task.id, vec![StepSpec::new("nsx.router.reticulate")])
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::UnknownStep { .. }));
    let (status, reason) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        reason.as_deref(),
        Some("No step registered as 'nsx.router.reticulate'")
    );
    assert_eq!(ctx.persistence.count_jobs(&task.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_chain_completes_immediately() {
    let ctx = TestContext::new(router_chain(Vec::new())).await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;

    let (status, _) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Complete);
    assert_eq!(ctx.drain().await, 0);
}

#[tokio::test]
async fn test_steps_share_task_data() {
    let ctx = TestContext::new(router_chain(vec![
        PutDataStep::spec("vmware_uuid", json!("4210-abcd")),
        PutDataStep::spec("nat_task_ids", json!([])),
        AwaitTasks::spec_from_data("nat_task_ids"),
    ]))
    .await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    ctx.drain().await;

    let task = ctx.persistence.latest_task(&router.id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(task.data_value("vmware_uuid"), Some(&json!("4210-abcd")));
}

#[tokio::test]
async fn test_job_for_finished_task_is_discarded() {
    let ctx = TestContext::new(router_chain(vec![RecordStep::spec("deploy")])).await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    let task = ctx.persistence.latest_task(&router.id).await.unwrap().unwrap();
    ctx.lifecycle
        .sync()
        .fail_mutation(&task.id, "cancelled by operator")
        .await
        .unwrap();

    assert_eq!(ctx.drain().await, 1);
    assert!(ctx.recorder.entries().is_empty());
    assert_eq!(ctx.persistence.count_jobs(&task.id).await.unwrap(), 0);
    let (_, reason) = latest_status(&ctx, &router.id).await;
    assert_eq!(reason.as_deref(), Some("cancelled by operator"));
}

#[tokio::test]
async fn test_stale_claim_neither_reruns_step_nor_forks_chain() {
    let ctx = TestContext::new(router_chain(vec![
        RecordStep::spec("deploy"),
        RecordStep::spec("deploy_locale"),
    ]))
    .await;

    let router = ctx.create(ResourceKind::Router, json!({})).await;
    let task = ctx.persistence.latest_task(&router.id).await.unwrap().unwrap();

    // A worker claims the first step and stalls past its lease.
    let now = Utc::now();
    let stale = ctx
        .persistence
        .claim_due_jobs(now, now - chrono::Duration::seconds(1), 10)
        .await
        .unwrap()
        .remove(0);

    // Another worker picks the job up and advances the chain.
    assert_eq!(ctx.worker.process_due_jobs().await.unwrap(), 1);
    assert_eq!(ctx.recorder.labels(), vec!["deploy"]);

    let result = ctx
        .lifecycle
        .executor()
        .execute(&stale, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(
        result,
        JobResult::Discarded {
            task_id: task.id.clone()
        }
    );
    assert_eq!(ctx.recorder.labels(), vec!["deploy"]);
    assert_eq!(ctx.persistence.count_jobs(&task.id).await.unwrap(), 1);

    ctx.drain().await;
    assert_eq!(ctx.recorder.labels(), vec!["deploy", "deploy_locale"]);
    let (status, _) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Complete);
}

#[tokio::test]
async fn test_await_tasks_propagates_dependency_failure() {
    let ctx = TestContext::new(HashMap::new()).await;
    let sync = ctx.lifecycle.sync();

    let vpc = ResourceRecord::new(ResourceKind::Router, json!({}));
    let router = ResourceRecord::new(ResourceKind::Router, json!({}));
    ctx.persistence.insert_resource(&vpc).await.unwrap();
    ctx.persistence.insert_resource(&router).await.unwrap();

    let dependency = sync.begin_mutation(&vpc.id, TaskType::Create).await.unwrap();
    let waiting = sync.begin_mutation(&router.id, TaskType::Create).await.unwrap();
    ctx.lifecycle
        .executor()
        .start(
            &waiting.id,
            vec![AwaitTasks::spec(&[dependency.id.clone()]).polling(10, Duration::ZERO)],
        )
        .await
        .unwrap();

    // Dependency still running: the gate releases.
    assert_eq!(ctx.worker.process_due_jobs().await.unwrap(), 1);
    let (status, _) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::InProgress);

    sync.fail_mutation(&dependency.id, "remote error: 500 boom")
        .await
        .unwrap();
    ctx.drain().await;

    let (status, reason) = latest_status(&ctx, &router.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        reason,
        Some(format!("Task '{}' in failed state", dependency.id))
    );
}

#[tokio::test]
async fn test_await_resource_sync_waits_for_completion() {
    let ctx = TestContext::new(HashMap::new()).await;
    let sync = ctx.lifecycle.sync();

    let router = ResourceRecord::new(ResourceKind::Router, json!({}));
    let network = ResourceRecord::new(ResourceKind::Network, json!({ "router_id": router.id }));
    ctx.persistence.insert_resource(&router).await.unwrap();
    ctx.persistence.insert_resource(&network).await.unwrap();

    let router_task = sync.begin_mutation(&router.id, TaskType::Create).await.unwrap();
    let network_task = sync.begin_mutation(&network.id, TaskType::Create).await.unwrap();
    ctx.lifecycle
        .executor()
        .start(
            &network_task.id,
            vec![
                AwaitResourceSync::spec(&[router.id.clone()]).polling(10, Duration::ZERO),
                RecordStep::spec("deploy"),
            ],
        )
        .await
        .unwrap();

    ctx.worker.process_due_jobs().await.unwrap();
    assert!(ctx.recorder.entries().is_empty());

    sync.complete_mutation(&router_task.id).await.unwrap();
    ctx.drain().await;

    assert_eq!(ctx.recorder.entries(), vec![format!("deploy@{}", network.id)]);
    let (status, _) = latest_status(&ctx, &network.id).await;
    assert_eq!(status, TaskStatus::Complete);
}

#[tokio::test]
async fn test_await_resource_sync_fails_on_failed_dependency() {
    let ctx = TestContext::new(HashMap::new()).await;
    let sync = ctx.lifecycle.sync();

    let router = ResourceRecord::new(ResourceKind::Router, json!({}));
    let network = ResourceRecord::new(ResourceKind::Network, json!({}));
    ctx.persistence.insert_resource(&router).await.unwrap();
    ctx.persistence.insert_resource(&network).await.unwrap();

    let router_task = sync.begin_mutation(&router.id, TaskType::Create).await.unwrap();
    sync.fail_mutation(&router_task.id, "boom").await.unwrap();

    let network_task = sync.begin_mutation(&network.id, TaskType::Create).await.unwrap();
    ctx.lifecycle
        .executor()
        .start(&network_task.id, vec![AwaitResourceSync::spec(&[router.id.clone()])])
        .await
        .unwrap();
    ctx.drain().await;

    let (status, reason) = latest_status(&ctx, &network.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        reason,
        Some(format!("Resource '{}' in failed sync state", router.id))
    );
}

#[tokio::test]
async fn test_await_resource_sync_fails_on_missing_dependency() {
    let ctx = TestContext::new(HashMap::new()).await;
    let sync = ctx.lifecycle.sync();

    let missing = ResourceKind::Router.generate_id();
    let state = await_resource_sync(sync, &[missing.clone()]).await.unwrap();
    assert_eq!(
        state,
        AwaitState::Failed(format!("Resource '{}' not found", missing))
    );

    let network = ResourceRecord::new(ResourceKind::Network, json!({ "router_id": missing }));
    ctx.persistence.insert_resource(&network).await.unwrap();
    let task = sync.begin_mutation(&network.id, TaskType::Create).await.unwrap();
    ctx.lifecycle
        .executor()
        .start(
            &task.id,
            vec![
                AwaitResourceSync::spec(&[missing.clone()]),
                RecordStep::spec("deploy"),
            ],
        )
        .await
        .unwrap();
    ctx.drain().await;

    assert!(ctx.recorder.entries().is_empty());
    let (status, reason) = latest_status(&ctx, &network.id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(reason, Some(format!("Resource '{}' not found", missing)));
}
