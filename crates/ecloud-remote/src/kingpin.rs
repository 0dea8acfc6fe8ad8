// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kingpin (VMware orchestration) API client.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::error::RemoteError;
use crate::http::HttpApi;

/// Exception Kingpin reports when the VM it was asked about does not exist.
pub const ENTITY_NOT_FOUND: &str = "UKFast.VimLibrary.Exception.EntityNotFoundException";

/// Parameters for deploying an instance from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDeploy {
    /// Instance ID the VM is named after.
    pub instance_id: String,
    /// VM template to clone.
    pub template_name: String,
    /// vCPU count.
    #[serde(rename = "numCPU")]
    pub vcpu: u32,
    /// Memory in MiB.
    pub ram_mib: u32,
    /// Guest platform (`Linux`, `Windows`).
    pub platform: String,
    /// Whether VM backups are enabled.
    pub backup_enabled: bool,
}

/// Compute allocated to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceShape {
    /// vCPU count.
    #[serde(rename = "numCPU", default)]
    pub vcpu: u32,
    /// Memory in MiB.
    #[serde(rename = "ramMiB", default)]
    pub ram_mib: u32,
}

#[derive(Debug, Deserialize)]
struct VolumeCreated {
    uuid: String,
}

/// Client for the Kingpin API.
#[derive(Debug, Clone)]
pub struct KingpinClient {
    api: HttpApi,
}

impl KingpinClient {
    /// Wrap an API handle.
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    fn volume_path(vpc_id: &str, vmware_uuid: &str) -> String {
        format!("/api/v1/vpc/{}/volume/{}", vpc_id, vmware_uuid)
    }

    fn instance_path(vpc_id: &str, instance_id: &str) -> String {
        format!("/api/v2/vpc/{}/instance/{}", vpc_id, instance_id)
    }

    /// Create a volume; returns its VMware UUID.
    #[instrument(skip(self))]
    pub async fn deploy_volume(
        &self,
        vpc_id: &str,
        volume_id: &str,
        capacity_gib: u64,
    ) -> Result<String, RemoteError> {
        let created: VolumeCreated = self
            .api
            .post_json(
                &format!("/api/v1/vpc/{}/volume", vpc_id),
                &json!({
                    "volumeId": volume_id,
                    "sizeGiB": capacity_gib,
                    "shared": false,
                }),
            )
            .await?;
        info!(volume_id, vmware_uuid = %created.uuid, "Volume deployed");
        Ok(created.uuid)
    }

    /// Resize a volume.
    #[instrument(skip(self))]
    pub async fn resize_volume(
        &self,
        vpc_id: &str,
        vmware_uuid: &str,
        capacity_gib: u64,
    ) -> Result<(), RemoteError> {
        let path = format!("{}/size", Self::volume_path(vpc_id, vmware_uuid));
        self.api
            .put_json(&path, &json!({ "sizeGiB": capacity_gib }))
            .await?;
        Ok(())
    }

    /// Delete a volume; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_volume(
        &self,
        vpc_id: &str,
        vmware_uuid: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::volume_path(vpc_id, vmware_uuid))
            .await?
            .is_some())
    }

    /// Clone an instance from its template.
    #[instrument(skip(self, deploy), fields(instance_id = %deploy.instance_id))]
    pub async fn deploy_instance(
        &self,
        vpc_id: &str,
        deploy: &InstanceDeploy,
    ) -> Result<Value, RemoteError> {
        self.api
            .post_json(&format!("/api/v2/vpc/{}/instance/fromtemplate", vpc_id), deploy)
            .await
    }

    /// Connect the NIC with `mac_address` to `network_id`.
    #[instrument(skip(self))]
    pub async fn connect_nic(
        &self,
        vpc_id: &str,
        instance_id: &str,
        mac_address: &str,
        network_id: &str,
    ) -> Result<(), RemoteError> {
        let path = format!(
            "{}/nic/{}/connect",
            Self::instance_path(vpc_id, instance_id),
            mac_address
        );
        self.api
            .put_json(&path, &json!({ "networkId": network_id }))
            .await?;
        Ok(())
    }

    /// Current VM shape, or `None` when Kingpin cannot find it.
    pub async fn get_instance(
        &self,
        vpc_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceShape>, RemoteError> {
        self.api
            .get_optional(&Self::instance_path(vpc_id, instance_id))
            .await
    }

    /// Resize the VM's compute, shutting the guest down first when asked.
    #[instrument(skip(self))]
    pub async fn resize_instance(
        &self,
        vpc_id: &str,
        instance_id: &str,
        shape: InstanceShape,
        guest_shutdown: bool,
    ) -> Result<(), RemoteError> {
        let path = format!("{}/resize", Self::instance_path(vpc_id, instance_id));
        self.api
            .put_json(
                &path,
                &json!({
                    "ramMiB": shape.ram_mib,
                    "numCPU": shape.vcpu,
                    "guestShutdown": guest_shutdown,
                }),
            )
            .await?;
        Ok(())
    }

    /// Power the instance on.
    #[instrument(skip(self))]
    pub async fn power_on(&self, vpc_id: &str, instance_id: &str) -> Result<(), RemoteError> {
        let path = format!("{}/power", Self::instance_path(vpc_id, instance_id));
        let _: Value = self.api.post_json(&path, &json!({})).await?;
        Ok(())
    }

    /// Power the instance off. A VM Kingpin cannot find counts as off;
    /// returns `false` in that case.
    #[instrument(skip(self))]
    pub async fn power_off(&self, vpc_id: &str, instance_id: &str) -> Result<bool, RemoteError> {
        let path = format!("{}/power", Self::instance_path(vpc_id, instance_id));
        match self.api.delete(&path).await {
            Ok(body) if is_entity_not_found(&body) => {
                info!(instance_id, "Attempted to power off, but entity was not found, skipping");
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(RemoteError::Client { body, .. } | RemoteError::Server { body, .. })
                if body_is_entity_not_found(&body) =>
            {
                info!(instance_id, "Attempted to power off, but entity was not found, skipping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the instance's VM; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn undeploy_instance(
        &self,
        vpc_id: &str,
        instance_id: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::instance_path(vpc_id, instance_id))
            .await?
            .is_some())
    }
}

fn is_entity_not_found(body: &Value) -> bool {
    body.get("ExceptionType").and_then(Value::as_str) == Some(ENTITY_NOT_FOUND)
}

fn body_is_entity_not_found(body: &str) -> bool {
    serde_json::from_str::<Value>(body).is_ok_and(|value| is_entity_not_found(&value))
}
