// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed reads of resource properties inside steps.

use ecloud_core::chain::{StepContext, StepError};
use ecloud_core::persistence::ResourceRecord;
use serde_json::Value;

/// A string property the step cannot run without.
pub(crate) fn required_str(resource: &ResourceRecord, key: &str) -> Result<String, StepError> {
    resource
        .property_str(key)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| missing(resource, key))
}

/// A non-negative integer property the step cannot run without.
pub(crate) fn required_u64(resource: &ResourceRecord, key: &str) -> Result<u64, StepError> {
    resource
        .property(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| missing(resource, key))
}

/// Like [`required_u64`], narrowed to `u32`.
pub(crate) fn required_u32(resource: &ResourceRecord, key: &str) -> Result<u32, StepError> {
    u32::try_from(required_u64(resource, key)?).map_err(|_| {
        StepError::failed(format!(
            "Resource '{}' has an out of range '{}'",
            resource.id, key
        ))
    })
}

fn missing(resource: &ResourceRecord, key: &str) -> StepError {
    StepError::failed(format!("Resource '{}' has no '{}'", resource.id, key))
}

/// The VPC a resource belongs to. Routers and instances carry it directly;
/// networks inherit it from their router.
pub(crate) async fn vpc_of(
    ctx: &StepContext<'_>,
    resource: &ResourceRecord,
) -> Result<String, StepError> {
    if let Some(vpc_id) = resource.property_str("vpc_id") {
        return Ok(vpc_id.to_string());
    }

    let router_id = required_str(resource, "router_id")?;
    let router = ctx
        .persistence()
        .get_resource(&router_id)
        .await?
        .ok_or_else(|| StepError::failed(format!("Router '{}' not found", router_id)))?;
    required_str(&router, "vpc_id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecloud_core::resource::ResourceKind;
    use serde_json::json;

    #[test]
    fn test_required_properties() {
        let volume = ResourceRecord::new(
            ResourceKind::Volume,
            json!({ "vpc_id": "vpc-1", "capacity": 100, "huge": 1u64 << 40 }),
        );

        assert_eq!(required_str(&volume, "vpc_id").unwrap(), "vpc-1");
        assert_eq!(required_u64(&volume, "capacity").unwrap(), 100);
        assert!(required_u32(&volume, "huge").is_err());

        let err = required_str(&volume, "vmware_uuid").unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Resource '{}' has no 'vmware_uuid'", volume.id)
        );
    }
}
