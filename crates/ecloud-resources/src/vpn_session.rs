// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VPN sessions: IPsec sessions under a router's VPN service.
//!
//! Each session owns the NO-SNAT rules that exempt its local networks from
//! source NAT, listed in its `no_snat_ids` property. Teardown deletes those
//! NATs first and waits for their delete tasks before removing the session:
//!
//! ```text
//! undeploy_no_snats -> await.tasks(no_snat_task_ids) -> undeploy
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use ecloud_core::CoreError;
use ecloud_core::chain::{AwaitTasks, Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::NsxClient;

use crate::props::{required_str, vpc_of};

/// Task data key holding the NO-SNAT delete task IDs.
pub const NO_SNAT_TASKS_KEY: &str = "no_snat_task_ids";

/// Polls while NO-SNAT teardown runs.
pub const AWAIT_NO_SNATS_ATTEMPTS: u32 = 30;

/// Delay between polls.
pub const AWAIT_NO_SNATS_BACKOFF: Duration = Duration::from_secs(5);

struct SessionPlacement {
    router_id: String,
    vpn_service_id: String,
}

async fn placement(
    ctx: &StepContext<'_>,
    session: &ResourceRecord,
) -> Result<(SessionPlacement, ResourceRecord), StepError> {
    let vpn_service_id = required_str(session, "vpn_service_id")?;
    let service = ctx
        .persistence()
        .get_resource(&vpn_service_id)
        .await?
        .ok_or_else(|| StepError::failed(format!("VPN service '{}' not found", vpn_service_id)))?;
    let router_id = required_str(&service, "router_id")?;

    Ok((
        SessionPlacement {
            router_id,
            vpn_service_id,
        },
        service,
    ))
}

/// PUT the IPsec session.
#[derive(Debug, Clone)]
pub struct DeployVpnSession {
    nsx: NsxClient,
}

impl DeployVpnSession {
    /// Registered name.
    pub const NAME: &'static str = "nsx.vpn_session.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployVpnSession {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let session = ctx.resource().await?;
        let remote_ip = required_str(&session, "remote_ip")?;
        let (placement, service) = placement(ctx, &session).await?;
        let vpc_id = vpc_of(ctx, &service).await?;

        self.nsx
            .put_vpn_session(
                &placement.router_id,
                &placement.vpn_service_id,
                &session.id,
                &vpc_id,
                &remote_ip,
            )
            .await?;

        info!(session_id = %session.id, remote_ip = %remote_ip, "VPN session deployed");
        Ok(StepOutcome::Success)
    }
}

/// Start teardown of the session's NO-SNAT rules and record the delete
/// tasks under [`NO_SNAT_TASKS_KEY`]. A NAT still busy with another unit of
/// work releases the step; tasks started so far are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndeployNoSnats;

impl UndeployNoSnats {
    /// Registered name.
    pub const NAME: &'static str = "nsx.vpn_session.undeploy_no_snats";

    /// Spec with the NO-SNAT polling policy.
    pub fn spec() -> StepSpec {
        StepSpec::new(Self::NAME).polling(AWAIT_NO_SNATS_ATTEMPTS, AWAIT_NO_SNATS_BACKOFF)
    }
}

#[async_trait]
impl Step for UndeployNoSnats {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let session = ctx.resource().await?;
        let nat_ids: Vec<String> = session
            .property("no_snat_ids")
            .and_then(|ids| ids.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut task_ids = ctx.task().data_ids(NO_SNAT_TASKS_KEY);
        let mut busy = None;
        for nat_id in &nat_ids {
            match ctx.begin_dependent_delete(nat_id).await {
                Ok(Some(task)) => task_ids.push(task.id),
                Ok(None) => {}
                Err(StepError::Core(CoreError::ResourceBusy { resource_id, .. })) => {
                    busy = Some(resource_id);
                }
                Err(e) => return Err(e),
            }
        }
        ctx.put_data(NO_SNAT_TASKS_KEY, json!(task_ids)).await?;

        if let Some(nat_id) = busy {
            info!(session_id = %session.id, nat_id = %nat_id, "NO-SNAT busy, retrying");
            return Ok(ctx.release());
        }
        info!(
            session_id = %session.id,
            nats = nat_ids.len(),
            "NO-SNAT teardown started"
        );
        Ok(StepOutcome::Success)
    }
}

/// DELETE the IPsec session. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployVpnSession {
    nsx: NsxClient,
}

impl UndeployVpnSession {
    /// Registered name.
    pub const NAME: &'static str = "nsx.vpn_session.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployVpnSession {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let session = ctx.resource().await?;
        let (placement, _) = placement(ctx, &session).await?;

        let removed = self
            .nsx
            .delete_vpn_session(&placement.router_id, &placement.vpn_service_id, &session.id)
            .await?;
        if !removed {
            info!(session_id = %session.id, "VPN session already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// Sync chains for VPN sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct VpnSessionChains;

impl ChainFactory for VpnSessionChains {
    fn create_chain(&self, _session: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(DeployVpnSession::NAME)]
    }

    fn delete_chain(&self, _session: &ResourceRecord) -> Vec<StepSpec> {
        vec![
            UndeployNoSnats::spec(),
            AwaitTasks::spec_from_data(NO_SNAT_TASKS_KEY)
                .polling(AWAIT_NO_SNATS_ATTEMPTS, AWAIT_NO_SNATS_BACKOFF),
            StepSpec::new(UndeployVpnSession::NAME),
        ]
    }
}
