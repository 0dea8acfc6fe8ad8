// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Floating IPs. NSX realises them as a source/destination NAT pair; the
//! floating IP's own sync only completes once both NATs have synced.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use ecloud_core::chain::{Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_core::task::TaskStatus;

/// Polls before giving up on the NATs.
pub const AWAIT_NAT_ATTEMPTS: u32 = 60;

/// Delay between polls.
pub const AWAIT_NAT_BACKOFF: Duration = Duration::from_secs(10);

const NATS: [(&str, &str); 2] = [
    ("source_nat_id", "Source"),
    ("destination_nat_id", "Destination"),
];

/// Gate on the floating IP's NATs. A NAT that does not exist is skipped; a
/// failed one fails the floating IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaitNatSync;

impl AwaitNatSync {
    /// Registered name.
    pub const NAME: &'static str = "nsx.floating_ip.await_nat";

    /// Spec with the NAT polling policy.
    pub fn spec() -> StepSpec {
        StepSpec::new(Self::NAME).polling(AWAIT_NAT_ATTEMPTS, AWAIT_NAT_BACKOFF)
    }
}

#[async_trait]
impl Step for AwaitNatSync {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let fip = ctx.resource().await?;

        let mut nats = Vec::with_capacity(NATS.len());
        for (key, label) in NATS {
            let Some(nat_id) = fip.property_str(key).filter(|id| !id.is_empty()) else {
                continue;
            };
            if ctx.persistence().get_resource(nat_id).await?.is_none() {
                debug!(fip_id = %fip.id, nat_id, "NAT does not exist, skipping");
                continue;
            }
            let status = ctx.sync().current_status(nat_id).await?.status;
            nats.push((label, nat_id, status));
        }

        if let Some((label, nat_id, _)) = nats
            .iter()
            .find(|(_, _, status)| *status == TaskStatus::Failed)
        {
            return Err(StepError::failed(format!(
                "{} NAT '{}' in failed sync state",
                label, nat_id
            )));
        }

        if let Some((label, nat_id, _)) = nats
            .iter()
            .find(|(_, _, status)| *status != TaskStatus::Complete)
        {
            warn!(fip_id = %fip.id, nat_id, "{} NAT not in sync, retrying", label);
            return Ok(ctx.release());
        }

        Ok(StepOutcome::Success)
    }
}

/// Sync chains for floating IPs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatingIpChains;

impl ChainFactory for FloatingIpChains {
    fn create_chain(&self, _fip: &ResourceRecord) -> Vec<StepSpec> {
        vec![AwaitNatSync::spec()]
    }

    fn delete_chain(&self, _fip: &ResourceRecord) -> Vec<StepSpec> {
        vec![AwaitNatSync::spec()]
    }
}
