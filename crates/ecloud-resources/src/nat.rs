// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NAT rules on a router's tier-1 gateway.

use async_trait::async_trait;
use tracing::info;

use ecloud_core::chain::{Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::{NatRule, NsxClient};

use crate::props::{required_str, vpc_of};

/// PUT the NAT rule.
#[derive(Debug, Clone)]
pub struct DeployNat {
    nsx: NsxClient,
}

impl DeployNat {
    /// Registered name.
    pub const NAME: &'static str = "nsx.nat.deploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for DeployNat {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let nat = ctx.resource().await?;
        let router_id = required_str(&nat, "router_id")?;
        let vpc_id = vpc_of(ctx, &nat).await?;

        let rule = nat_rule(&nat)?;
        self.nsx
            .put_nat_rule(&router_id, &nat.id, &vpc_id, &rule)
            .await?;

        info!(nat_id = %nat.id, action = %rule.action, "NAT deployed");
        Ok(StepOutcome::Success)
    }
}

fn nat_rule(nat: &ResourceRecord) -> Result<NatRule, StepError> {
    let optional = |key: &str| {
        nat.property_str(key)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let sequence_number = match nat.property("sequence").and_then(|v| v.as_u64()) {
        None => 0,
        Some(sequence) => u32::try_from(sequence).map_err(|_| {
            StepError::failed(format!("NAT '{}' has an out of range 'sequence'", nat.id))
        })?,
    };

    Ok(NatRule {
        action: required_str(nat, "action")?,
        source_network: optional("source"),
        destination_network: optional("destination"),
        translated_network: optional("translated"),
        sequence_number,
    })
}

/// DELETE the NAT rule. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployNat {
    nsx: NsxClient,
}

impl UndeployNat {
    /// Registered name.
    pub const NAME: &'static str = "nsx.nat.undeploy";

    /// Step over `nsx`.
    pub fn new(nsx: NsxClient) -> Self {
        Self { nsx }
    }
}

#[async_trait]
impl Step for UndeployNat {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let nat = ctx.resource().await?;
        let router_id = required_str(&nat, "router_id")?;
        if !self.nsx.delete_nat_rule(&router_id, &nat.id).await? {
            info!(nat_id = %nat.id, "NAT already removed from NSX");
        }
        Ok(StepOutcome::Success)
    }
}

/// Sync chains for NAT rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatChains;

impl ChainFactory for NatChains {
    fn create_chain(&self, _nat: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(DeployNat::NAME)]
    }

    fn delete_chain(&self, _nat: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(UndeployNat::NAME)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecloud_core::resource::ResourceKind;
    use serde_json::json;

    #[test]
    fn test_nat_rule_reads_optional_networks() {
        let nat = ResourceRecord::new(
            ResourceKind::Nat,
            json!({
                "action": "SNAT",
                "source": "10.0.0.0/24",
                "destination": "",
                "translated": "203.0.113.10",
                "sequence": 10,
            }),
        );
        let rule = nat_rule(&nat).unwrap();
        assert_eq!(rule.action, "SNAT");
        assert_eq!(rule.source_network.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(rule.destination_network, None);
        assert_eq!(rule.translated_network.as_deref(), Some("203.0.113.10"));
        assert_eq!(rule.sequence_number, 10);

        let actionless = ResourceRecord::new(ResourceKind::Nat, json!({}));
        assert!(nat_rule(&actionless).is_err());
    }
}
