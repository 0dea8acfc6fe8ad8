// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ecloud-resources integration tests.
//!
//! Wires the real steps, chains and hooks against wiremock NSX and Kingpin
//! servers and an in-memory SQLite database.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use wiremock::MockServer;

use ecloud_core::config::LockSettings;
use ecloud_core::lifecycle::ResourceLifecycle;
use ecloud_core::lock::InMemoryLockManager;
use ecloud_core::persistence::{Persistence, ResourceRecord, SqlitePersistence, TaskRecord};
use ecloud_core::resource::ResourceKind;
use ecloud_core::worker::{Worker, WorkerConfig};
use ecloud_remote::{EndpointConfig, HttpApi, KingpinClient, NsxClient};
use ecloud_resources::Remotes;

pub const EDGE_CLUSTER_ID: &str = "8bc61267-583e-4988-b5d9-16b46f7fe900";

pub struct TestEnv {
    pub nsx: MockServer,
    pub kingpin: MockServer,
    pub persistence: Arc<dyn Persistence>,
    pub lifecycle: Arc<ResourceLifecycle>,
    pub worker: Worker,
}

impl TestEnv {
    pub async fn new() -> Self {
        let nsx = MockServer::start().await;
        let kingpin = MockServer::start().await;

        let timeout = Duration::from_secs(5);
        let remotes = Remotes {
            nsx: NsxClient::new(
                HttpApi::new(&EndpointConfig::new(nsx.uri()), timeout).unwrap(),
                "ukfast",
                EDGE_CLUSTER_ID,
            ),
            kingpin: KingpinClient::new(
                HttpApi::new(&EndpointConfig::new(kingpin.uri()), timeout).unwrap(),
            ),
        };

        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory database"),
        );

        let lifecycle = Arc::new(ResourceLifecycle::new(
            persistence.clone(),
            Arc::new(InMemoryLockManager::new()),
            LockSettings {
                ttl: Duration::from_secs(5),
                max_wait: Duration::from_secs(10),
            },
            ecloud_resources::steps(&remotes),
            ecloud_resources::chains(),
            ecloud_resources::hooks(),
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
            nsx,
            kingpin,
            persistence,
            lifecycle,
            worker,
        }
    }

    /// Run the queue until nothing is due. Returns jobs executed.
    pub async fn drain(&self) -> usize {
        let mut executed = 0;
        for _ in 0..200 {
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

    /// Save a new resource through the lifecycle.
    pub async fn create(&self, kind: ResourceKind, properties: Value) -> ResourceRecord {
        let mut resource = ResourceRecord::new(kind, properties);
        self.lifecycle
            .save(&mut resource)
            .await
            .expect("Failed to save resource");
        resource
    }

    pub async fn latest_task(&self, resource_id: &str) -> TaskRecord {
        self.persistence
            .latest_task(resource_id)
            .await
            .unwrap()
            .expect("resource should have a task")
    }

    /// `(method, path)` of every request `server` received, in order.
    pub async fn requests(server: &MockServer) -> Vec<(String, String)> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| (request.method.to_string(), request.url.path().to_string()))
            .collect()
    }
}
