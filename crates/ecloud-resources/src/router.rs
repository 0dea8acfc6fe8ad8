// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routers: NSX tier-1 gateways.
//!
//! Deploy attaches the gateway to the availability zone's default tier-0,
//! places its locale services on the edge cluster and flips the default
//! gateway rule to REJECT. Teardown deletes the gateway and polls until NSX
//! no longer returns it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use ecloud_core::chain::{Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::NsxClient;

use crate::props::required_str;

/// Polls allowed while NSX finishes removing a gateway.
pub const UNDEPLOY_CHECK_ATTEMPTS: u32 = 60;

/// Delay between teardown polls.
pub const UNDEPLOY_CHECK_BACKOFF: Duration = Duration::from_secs(5);

/// PUT the tier-1 gateway.
#[derive(Debug, Clone)]
pub struct DeployRouter {
    nsx: NsxClient,
}

impl DeployRouter {
    /// Registered name.
    pub const NAME: &'static str = "nsx.router.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let router = ctx.resource().await?;
        let vpc_id = required_str(&router, "vpc_id")?;

        let tier0_path = self.nsx.default_tier0_path().await?;
        self.nsx.put_tier1(&router.id, &vpc_id, &tier0_path).await?;

        info!(router_id = %router.id, tier0_path = %tier0_path, "Router deployed");
        Ok(StepOutcome::Success)
    }
}

/// PUT the gateway's locale services.
#[derive(Debug, Clone)]
pub struct DeployRouterLocale {
    nsx: NsxClient,
}

impl DeployRouterLocale {
    /// Registered name.
    pub const NAME: &'static str = "nsx.router.deploy_locale";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployRouterLocale {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let router = ctx.resource().await?;
        let vpc_id = required_str(&router, "vpc_id")?;
        self.nsx.put_locale_services(&router.id, &vpc_id).await?;
        Ok(StepOutcome::Success)
    }
}

/// Switch the gateway's default rule to REJECT.
#[derive(Debug, Clone)]
pub struct DefaultFirewallRule {
    nsx: NsxClient,
}

impl DefaultFirewallRule {
    /// Registered name.
    pub const NAME: &'static str = "nsx.router.default_firewall_rule";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DefaultFirewallRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        self.nsx.reject_by_default(ctx.resource_id()).await?;
        Ok(StepOutcome::Success)
    }
}

/// DELETE the tier-1 gateway. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployRouter {
    nsx: NsxClient,
}

impl UndeployRouter {
    /// Registered name.
    pub const NAME: &'static str = "nsx.router.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        if !self.nsx.delete_tier1(ctx.resource_id()).await? {
            info!(router_id = %ctx.resource_id(), "Router already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// Release until NSX stops returning the gateway.
#[derive(Debug, Clone)]
pub struct UndeployRouterCheck {
    nsx: NsxClient,
}

impl UndeployRouterCheck {
    /// Registered name.
    pub const NAME: &'static str = "nsx.router.undeploy_check";

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
impl Step for UndeployRouterCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        match self.nsx.get_tier1(ctx.resource_id()).await? {
            None => Ok(StepOutcome::Success),
            Some(_) => Ok(ctx.release()),
        }
    }
}

/// Sync chains for routers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterChains;

impl ChainFactory for RouterChains {
    fn create_chain(&self, _router: &ResourceRecord) -> Vec<StepSpec> {
        vec![
            StepSpec::new(DeployRouter::NAME),
            StepSpec::new(DeployRouterLocale::NAME),
            StepSpec::new(DefaultFirewallRule::NAME),
        ]
    }

    fn delete_chain(&self, _router: &ResourceRecord) -> Vec<StepSpec> {
        vec![
            StepSpec::new(UndeployRouter::NAME),
            UndeployRouterCheck::spec(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecloud_core::resource::ResourceKind;
    use serde_json::json;

    #[test]
    fn test_router_chains() {
        let router = ResourceRecord::new(ResourceKind::Router, json!({ "vpc_id": "vpc-1" }));

        let names: Vec<_> = RouterChains
            .create_chain(&router)
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "nsx.router.deploy",
                "nsx.router.deploy_locale",
                "nsx.router.default_firewall_rule"
            ]
        );
        assert_eq!(RouterChains.update_chain(&router), RouterChains.create_chain(&router));

        let delete = RouterChains.delete_chain(&router);
        assert_eq!(delete[1].name, "nsx.router.undeploy_check");
        assert_eq!(delete[1].max_attempts, UNDEPLOY_CHECK_ATTEMPTS);
    }
}
