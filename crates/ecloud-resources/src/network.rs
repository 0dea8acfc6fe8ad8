// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Networks: NSX segments under a router's tier-1 gateway.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use ecloud_core::chain::{AwaitResourceSync, Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::lifecycle::{HookContext, HookOutcome, Reaction};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::NsxClient;

use crate::props::{required_str, vpc_of};
use crate::router::{UNDEPLOY_CHECK_ATTEMPTS, UNDEPLOY_CHECK_BACKOFF};

/// Subnet given to networks created without one.
pub const DEFAULT_SUBNET: &str = "10.0.0.0/24";

/// Gateway address (first host, with prefix) of an IPv4 CIDR:
/// `10.0.0.0/24` gives `10.0.0.1/24`.
pub fn gateway_address(subnet: &str) -> Option<String> {
    let (address, prefix) = subnet.split_once('/')?;
    let address: Ipv4Addr = address.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if !(1..=30).contains(&prefix) {
        return None;
    }

    let mask = u32::MAX << (32 - prefix);
    let gateway = Ipv4Addr::from((u32::from(address) & mask) + 1);
    Some(format!("{}/{}", gateway, prefix))
}

/// PUT the segment.
#[derive(Debug, Clone)]
pub struct DeployNetwork {
    nsx: NsxClient,
}

impl DeployNetwork {
    /// Registered name.
    pub const NAME: &'static str = "nsx.network.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployNetwork {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let network = ctx.resource().await?;
        let router_id = required_str(&network, "router_id")?;
        let subnet = required_str(&network, "subnet")?;
        let gateway = gateway_address(&subnet).ok_or_else(|| {
            StepError::failed(format!("Invalid subnet '{}' on network '{}'", subnet, network.id))
        })?;
        let vpc_id = vpc_of(ctx, &network).await?;

        self.nsx
            .put_segment(&router_id, &network.id, &vpc_id, &gateway)
            .await?;

        info!(
            network_id = %network.id,
            router_id = %router_id,
            gateway = %gateway,
            "Network deployed"
        );
        Ok(StepOutcome::Success)
    }
}

/// DELETE the segment. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployNetwork {
    nsx: NsxClient,
}

impl UndeployNetwork {
    /// Registered name.
    pub const NAME: &'static str = "nsx.network.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployNetwork {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let network = ctx.resource().await?;
        let router_id = required_str(&network, "router_id")?;
        if !self.nsx.delete_segment(&router_id, &network.id).await? {
            info!(network_id = %network.id, "Network already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// Release until NSX stops returning the segment.
#[derive(Debug, Clone)]
pub struct UndeployNetworkCheck {
    nsx: NsxClient,
}

impl UndeployNetworkCheck {
    /// Registered name.
    pub const NAME: &'static str = "nsx.network.undeploy_check";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }

    /// Spec with the teardown polling policy.
    pub fn spec() -> StepSpec {
        StepSpec::new(Self::NAME).polling(UNDEPLOY_CHECK_ATTEMPTS, UNDEPLOY_CHECK_BACKOFF)
    }
}

#[async_trait]
impl Step for UndeployNetworkCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let network = ctx.resource().await?;
        let router_id = required_str(&network, "router_id")?;
        match self.nsx.get_segment(&router_id, &network.id).await? {
            None => Ok(StepOutcome::Success),
            Some(_) => Ok(ctx.release()),
        }
    }
}

/// Sync chains for networks. Creation waits for the router to finish
/// syncing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkChains;

impl ChainFactory for NetworkChains {
    fn create_chain(&self, network: &ResourceRecord) -> Vec<StepSpec> {
        let mut steps = Vec::with_capacity(2);
        if let Some(router_id) = network.property_str("router_id") {
            steps.push(AwaitResourceSync::spec(&[router_id.to_string()]));
        }
        steps.push(StepSpec::new(DeployNetwork::NAME));
        steps
    }

    fn delete_chain(&self, _network: &ResourceRecord) -> Vec<StepSpec> {
        vec![
            StepSpec::new(UndeployNetwork::NAME),
            UndeployNetworkCheck::spec(),
        ]
    }
}

/// Gives new networks [`DEFAULT_SUBNET`] when none was requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSubnet;

#[async_trait]
impl Reaction for DefaultSubnet {
    fn name(&self) -> &'static str {
        "default_subnet"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> ecloud_core::Result<HookOutcome> {
        if ctx.resource.property_str("subnet").is_none() {
            ctx.resource
                .set_property("subnet", Value::String(DEFAULT_SUBNET.to_string()));
        }
        Ok(HookOutcome::Continue)
    }
}
