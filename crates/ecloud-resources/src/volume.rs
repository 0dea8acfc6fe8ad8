// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volumes: Kingpin block volumes.
//!
//! The VMware UUID Kingpin assigns on deploy is the handle for every later
//! call. Deploy stores it in the task's data bag and on the resource.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use ecloud_core::chain::{Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::ChainFactory;
use ecloud_remote::KingpinClient;

use crate::props::{required_str, required_u64};

/// Property and task-data key holding the VMware UUID.
pub const VMWARE_UUID: &str = "vmware_uuid";

/// Create the volume in Kingpin.
#[derive(Debug, Clone)]
pub struct DeployVolume {
    kingpin: KingpinClient,
}

impl DeployVolume {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.volume.deploy";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for DeployVolume {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let mut volume = ctx.resource().await?;
        if let Some(uuid) = volume.property_str(VMWARE_UUID) {
            info!(volume_id = %volume.id, vmware_uuid = %uuid, "Volume already deployed");
            return Ok(StepOutcome::Success);
        }

        let vpc_id = required_str(&volume, "vpc_id")?;
        let capacity = required_u64(&volume, "capacity")?;
        let uuid = self
            .kingpin
            .deploy_volume(&vpc_id, &volume.id, capacity)
            .await?;

        ctx.put_data(VMWARE_UUID, Value::String(uuid.clone())).await?;
        volume.set_property(VMWARE_UUID, Value::String(uuid));
        ctx.store_resource(&volume).await?;
        Ok(StepOutcome::Success)
    }
}

/// Resize the volume to its `capacity`.
#[derive(Debug, Clone)]
pub struct VolumeCapacity {
    kingpin: KingpinClient,
}

impl VolumeCapacity {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.volume.capacity";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for VolumeCapacity {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let volume = ctx.resource().await?;
        let vpc_id = required_str(&volume, "vpc_id")?;
        let uuid = required_str(&volume, VMWARE_UUID)?;
        let capacity = required_u64(&volume, "capacity")?;

        self.kingpin.resize_volume(&vpc_id, &uuid, capacity).await?;
        info!(volume_id = %volume.id, capacity, "Volume resized");
        Ok(StepOutcome::Success)
    }
}

/// Delete the volume from Kingpin. Never deployed or already gone counts
/// as done.
#[derive(Debug, Clone)]
pub struct UndeployVolume {
    kingpin: KingpinClient,
}

impl UndeployVolume {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.volume.undeploy";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for UndeployVolume {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let volume = ctx.resource().await?;
        let Some(uuid) = volume.property_str(VMWARE_UUID) else {
            info!(volume_id = %volume.id, "Volume was never deployed");
            return Ok(StepOutcome::Success);
        };

        let vpc_id = required_str(&volume, "vpc_id")?;
        if !self.kingpin.delete_volume(&vpc_id, uuid).await? {
            info!(volume_id = %volume.id, vmware_uuid = %uuid, "Volume already removed");
        }
        Ok(StepOutcome::Success)
    }
}

/// Sync chains for volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeChains;

impl ChainFactory for VolumeChains {
    fn create_chain(&self, _volume: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(DeployVolume::NAME)]
    }

    fn update_chain(&self, volume: &ResourceRecord) -> Vec<StepSpec> {
        // A failed create leaves nothing to resize.
        if volume.property_str(VMWARE_UUID).is_none() {
            return self.create_chain(volume);
        }
        vec![StepSpec::new(VolumeCapacity::NAME)]
    }

    fn delete_chain(&self, _volume: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(UndeployVolume::NAME)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecloud_core::resource::ResourceKind;
    use serde_json::json;

    #[test]
    fn test_update_chain_deploys_until_uuid_known() {
        let mut volume = ResourceRecord::new(
            ResourceKind::Volume,
            json!({ "vpc_id": "vpc-1", "capacity": 20 }),
        );
        assert_eq!(VolumeChains.update_chain(&volume)[0].name, DeployVolume::NAME);

        volume.set_property(VMWARE_UUID, json!("d7a86079"));
        assert_eq!(VolumeChains.update_chain(&volume)[0].name, VolumeCapacity::NAME);
    }
}
