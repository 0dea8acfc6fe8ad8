// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firewall policies and rules: NSX gateway policies scoped to a router.
//!
//! A rule is only saved while its policy can be updated; see
//! [`ParentSyncGate`](ecloud_core::lifecycle::ParentSyncGate).

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use ecloud_core::chain::{AwaitResourceSync, Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::{GatewayRule, NsxClient};

use crate::props::{required_str, required_u32, vpc_of};

/// Property naming a rule's policy.
pub const POLICY_KEY: &str = "firewall_policy_id";

fn addresses(resource: &ResourceRecord, key: &str) -> Vec<String> {
    match resource.property(key) {
        Some(Value::String(list)) => list
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty() && *a != "ANY")
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

async fn policy_of(
    ctx: &StepContext<'_>,
    rule: &ResourceRecord,
) -> Result<ResourceRecord, StepError> {
    let policy_id = required_str(rule, POLICY_KEY)?;
    ctx.persistence()
        .get_resource(&policy_id)
        .await?
        .ok_or_else(|| StepError::failed(format!("Firewall policy '{}' not found", policy_id)))
}

/// PUT the gateway policy.
#[derive(Debug, Clone)]
pub struct DeployFirewallPolicy {
    nsx: NsxClient,
}

impl DeployFirewallPolicy {
    /// Registered name.
    pub const NAME: &'static str = "nsx.firewall_policy.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployFirewallPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let policy = ctx.resource().await?;
        let sequence = required_u32(&policy, "sequence")?;
        let vpc_id = vpc_of(ctx, &policy).await?;
        let display_name = policy.name.clone().unwrap_or_else(|| policy.id.clone());

        self.nsx
            .put_gateway_policy(&policy.id, &vpc_id, &display_name, sequence)
            .await?;

        info!(policy_id = %policy.id, sequence, "Firewall policy deployed");
        Ok(StepOutcome::Success)
    }
}

/// DELETE the gateway policy. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployFirewallPolicy {
    nsx: NsxClient,
}

impl UndeployFirewallPolicy {
    /// Registered name.
    pub const NAME: &'static str = "nsx.firewall_policy.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployFirewallPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let policy_id = ctx.resource_id();
        if !self.nsx.delete_gateway_policy(policy_id).await? {
            info!(policy_id, "Firewall policy already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// PUT the rule into its policy, scoped to the policy's router.
#[derive(Debug, Clone)]
pub struct DeployFirewallRule {
    nsx: NsxClient,
}

impl DeployFirewallRule {
    /// Registered name.
    pub const NAME: &'static str = "nsx.firewall_rule.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployFirewallRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let rule = ctx.resource().await?;
        let policy = policy_of(ctx, &rule).await?;
        let router_id = required_str(&policy, "router_id")?;
        let vpc_id = vpc_of(ctx, &policy).await?;

        let gateway_rule = GatewayRule {
            action: required_str(&rule, "action")?,
            direction: rule
                .property_str("direction")
                .unwrap_or("IN_OUT")
                .to_string(),
            sequence_number: required_u32(&rule, "sequence")?,
            sources: addresses(&rule, "source"),
            destinations: addresses(&rule, "destination"),
        };
        self.nsx
            .put_gateway_rule(&policy.id, &rule.id, &router_id, &vpc_id, &gateway_rule)
            .await?;

        info!(
            rule_id = %rule.id,
            policy_id = %policy.id,
            action = %gateway_rule.action,
            "Firewall rule deployed"
        );
        Ok(StepOutcome::Success)
    }
}

/// DELETE the rule. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployFirewallRule {
    nsx: NsxClient,
}

impl UndeployFirewallRule {
    /// Registered name.
    pub const NAME: &'static str = "nsx.firewall_rule.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployFirewallRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let rule = ctx.resource().await?;
        let policy_id = required_str(&rule, POLICY_KEY)?;
        if !self.nsx.delete_gateway_rule(&policy_id, &rule.id).await? {
            info!(rule_id = %rule.id, "Firewall rule already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// Sync chains for firewall policies. Creation waits for the router.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirewallPolicyChains;

impl ChainFactory for FirewallPolicyChains {
    fn create_chain(&self, policy: &ResourceRecord) -> Vec<StepSpec> {
        let mut steps = Vec::with_capacity(2);
        if let Some(router_id) = policy.property_str("router_id") {
            steps.push(AwaitResourceSync::spec(&[router_id.to_string()]));
        }
        steps.push(StepSpec::new(DeployFirewallPolicy::NAME));
        steps
    }

    fn delete_chain(&self, _policy: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(UndeployFirewallPolicy::NAME)]
    }
}

/// Sync chains for firewall rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirewallRuleChains;

impl ChainFactory for FirewallRuleChains {
    fn create_chain(&self, _rule: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(DeployFirewallRule::NAME)]
    }

    fn delete_chain(&self, _rule: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(UndeployFirewallRule::NAME)]
    }
}
