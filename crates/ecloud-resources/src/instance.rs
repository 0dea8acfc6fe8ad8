// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instances: Kingpin virtual machines.
//!
//! Deploy clones the VM from its template once its network has synced,
//! connects its NICs and powers it on. Updates resize compute in place.
//! Teardown powers off and deletes the VM. `power_on` and `power_off` are
//! available as named tasks.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use ecloud_core::chain::{AwaitResourceSync, Step, StepContext, StepError, StepOutcome, StepSpec};
use ecloud_core::lifecycle::{HookContext, HookOutcome, Reaction};
use ecloud_core::persistence::ResourceRecord;
use ecloud_core::registry::{ChainFactory, ChainRegistry};
use ecloud_core::resource::ResourceKind;
use ecloud_remote::{InstanceDeploy, InstanceShape, KingpinClient};

use crate::props::{required_str, required_u32};

/// Named task powering an instance on.
pub const POWER_ON_TASK: &str = "power_on";

/// Named task powering an instance off.
pub const POWER_OFF_TASK: &str = "power_off";

/// Guest platform of an instance.
pub fn platform_of(resource: &ResourceRecord) -> &str {
    resource.property_str("platform").unwrap_or("Linux")
}

/// Whether a resize from `current` to `desired` needs the guest shut down.
///
/// Shrinking CPU or memory always does. Growing memory across the hot-add
/// limit (16 GiB on Windows, 3 GiB otherwise) does too.
pub fn needs_guest_shutdown(
    platform: &str,
    current: InstanceShape,
    desired: InstanceShape,
) -> bool {
    let hot_add_limit_gib = if platform == "Windows" { 16 } else { 3 };
    let hot_add_limit = hot_add_limit_gib * 1024;

    desired.ram_mib < current.ram_mib
        || desired.vcpu < current.vcpu
        || (desired.ram_mib > hot_add_limit && current.ram_mib <= hot_add_limit)
}

fn desired_shape(instance: &ResourceRecord) -> Result<InstanceShape, StepError> {
    Ok(InstanceShape {
        vcpu: required_u32(instance, "vcpu_cores")?,
        ram_mib: required_u32(instance, "ram_capacity")?,
    })
}

/// Clone the VM from its template.
#[derive(Debug, Clone)]
pub struct DeployInstance {
    kingpin: KingpinClient,
}

impl DeployInstance {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.deploy";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for DeployInstance {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let vpc_id = required_str(&instance, "vpc_id")?;
        let shape = desired_shape(&instance)?;

        let deploy = InstanceDeploy {
            instance_id: instance.id.clone(),
            template_name: required_str(&instance, "template_name")?,
            vcpu: shape.vcpu,
            ram_mib: shape.ram_mib,
            platform: platform_of(&instance).to_string(),
            backup_enabled: instance
                .property("backup_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        self.kingpin.deploy_instance(&vpc_id, &deploy).await?;

        info!(
            instance_id = %instance.id,
            template = %deploy.template_name,
            "Instance deployed"
        );
        Ok(StepOutcome::Success)
    }
}

#[derive(Debug, Deserialize)]
struct Nic {
    mac_address: String,
    network_id: String,
}

/// Connect each of the instance's NICs to its network.
#[derive(Debug, Clone)]
pub struct ConfigureNetworkAdapters {
    kingpin: KingpinClient,
}

impl ConfigureNetworkAdapters {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.network_adapters";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for ConfigureNetworkAdapters {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let nics: Vec<Nic> = match instance.property("nics") {
            Some(nics) => serde_json::from_value(nics.clone()).map_err(|e| {
                StepError::failed(format!("Invalid nics on instance '{}': {}", instance.id, e))
            })?,
            None => Vec::new(),
        };

        if nics.is_empty() {
            debug!(instance_id = %instance.id, "No NICs to connect");
            return Ok(StepOutcome::Success);
        }

        let vpc_id = required_str(&instance, "vpc_id")?;
        for nic in &nics {
            self.kingpin
                .connect_nic(&vpc_id, &instance.id, &nic.mac_address, &nic.network_id)
                .await?;
        }
        Ok(StepOutcome::Success)
    }
}

/// Power the VM on.
#[derive(Debug, Clone)]
pub struct PowerOn {
    kingpin: KingpinClient,
}

impl PowerOn {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.power_on";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for PowerOn {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let vpc_id = required_str(&instance, "vpc_id")?;
        self.kingpin.power_on(&vpc_id, &instance.id).await?;
        Ok(StepOutcome::Success)
    }
}

/// Power the VM off. A VM Kingpin cannot find is already off.
#[derive(Debug, Clone)]
pub struct PowerOff {
    kingpin: KingpinClient,
}

impl PowerOff {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.power_off";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for PowerOff {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let vpc_id = required_str(&instance, "vpc_id")?;
        self.kingpin.power_off(&vpc_id, &instance.id).await?;
        Ok(StepOutcome::Success)
    }
}

/// Resize the VM to the instance's `vcpu_cores` and `ram_capacity`.
#[derive(Debug, Clone)]
pub struct ComputeUpdate {
    kingpin: KingpinClient,
}

impl ComputeUpdate {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.compute_update";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for ComputeUpdate {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let vpc_id = required_str(&instance, "vpc_id")?;
        let desired = desired_shape(&instance)?;

        let Some(current) = self.kingpin.get_instance(&vpc_id, &instance.id).await? else {
            warn!(instance_id = %instance.id, "Instance not found in Kingpin, skipping resize");
            return Ok(StepOutcome::Success);
        };
        if current.vcpu == 0 || current.ram_mib == 0 {
            return Ok(StepOutcome::Fail(
                "Unable to determine current vCPU/RAM for instance".to_string(),
            ));
        }
        if current == desired {
            debug!(instance_id = %instance.id, "No compute changes required");
            return Ok(StepOutcome::Success);
        }

        let guest_shutdown = needs_guest_shutdown(platform_of(&instance), current, desired);
        info!(
            instance_id = %instance.id,
            ram_mib = desired.ram_mib,
            vcpu = desired.vcpu,
            guest_shutdown,
            "Resizing instance compute"
        );
        self.kingpin
            .resize_instance(&vpc_id, &instance.id, desired, guest_shutdown)
            .await?;
        Ok(StepOutcome::Success)
    }
}

/// Delete the VM. Already gone counts as done.
#[derive(Debug, Clone)]
pub struct UndeployInstance {
    kingpin: KingpinClient,
}

impl UndeployInstance {
    /// Registered name.
    pub const NAME: &'static str = "kingpin.instance.undeploy";

    /// Step over `kingpin`.
    pub fn new(kingpin: KingpinClient) -> Self {
        Self { kingpin }
    }
}

#[async_trait]
impl Step for UndeployInstance {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let instance = ctx.resource().await?;
        let vpc_id = required_str(&instance, "vpc_id")?;
        if !self.kingpin.undeploy_instance(&vpc_id, &instance.id).await? {
            info!(instance_id = %instance.id, "Instance already removed");
        }
        Ok(StepOutcome::Success)
    }
}

/// Sync chains for instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceChains;

impl ChainFactory for InstanceChains {
    fn create_chain(&self, instance: &ResourceRecord) -> Vec<StepSpec> {
        let mut steps = Vec::with_capacity(4);
        if let Some(network_id) = instance.property_str("network_id") {
            steps.push(AwaitResourceSync::spec(&[network_id.to_string()]));
        }
        steps.extend([
            StepSpec::new(DeployInstance::NAME),
            StepSpec::new(ConfigureNetworkAdapters::NAME),
            StepSpec::new(PowerOn::NAME),
        ]);
        steps
    }

    fn update_chain(&self, _instance: &ResourceRecord) -> Vec<StepSpec> {
        vec![StepSpec::new(ComputeUpdate::NAME)]
    }

    fn delete_chain(&self, _instance: &ResourceRecord) -> Vec<StepSpec> {
        vec![
            StepSpec::new(PowerOff::NAME),
            StepSpec::new(UndeployInstance::NAME),
        ]
    }
}

/// Register the instance sync chains and named power tasks.
pub fn register_chains(chains: ChainRegistry) -> ChainRegistry {
    chains
        .with(ResourceKind::Instance, InstanceChains)
        .with_task(ResourceKind::Instance, POWER_ON_TASK, |_, _| {
            vec![StepSpec::new(PowerOn::NAME)]
        })
        .with_task(ResourceKind::Instance, POWER_OFF_TASK, |_, _| {
            vec![StepSpec::new(PowerOff::NAME)]
        })
}

/// Derives `platform` from the template name when none was given.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlatform;

#[async_trait]
impl Reaction for DefaultPlatform {
    fn name(&self) -> &'static str {
        "default_platform"
    }

    async fn handle(&self, ctx: &mut HookContext<'_>) -> ecloud_core::Result<HookOutcome> {
        if ctx.resource.property_str("platform").is_none() {
            let windows = ctx
                .resource
                .property_str("template_name")
                .is_some_and(|name| name.to_ascii_lowercase().contains("windows"));
            let platform = if windows { "Windows" } else { "Linux" };
            ctx.resource
                .set_property("platform", Value::String(platform.to_string()));
        }
        Ok(HookOutcome::Continue)
    }
}
