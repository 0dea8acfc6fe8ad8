// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource identity: kinds, ID prefixes and ID generation.
//!
//! Every mutable entity is addressed by an opaque `<prefix>-<8 hex>` ID. The
//! prefix identifies the [`ResourceKind`], which in turn selects the chain
//! factory and lifecycle reactions registered for it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// The kinds of resource the control plane manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual private cloud.
    Vpc,
    /// Tier-1 router.
    Router,
    /// Network segment attached to a router.
    Network,
    /// Virtual machine.
    Instance,
    /// Block volume.
    Volume,
    /// Gateway firewall policy.
    FirewallPolicy,
    /// Rule within a firewall policy.
    FirewallRule,
    /// Network interface card.
    Nic,
    /// Public floating IP.
    FloatingIp,
    /// NAT rule.
    Nat,
    /// VPN service on a router.
    VpnService,
    /// VPN session on a VPN service.
    VpnSession,
    /// DHCP server profile.
    Dhcp,
}

impl ResourceKind {
    /// Every kind the control plane knows about.
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::Vpc,
        ResourceKind::Router,
        ResourceKind::Network,
        ResourceKind::Instance,
        ResourceKind::Volume,
        ResourceKind::FirewallPolicy,
        ResourceKind::FirewallRule,
        ResourceKind::Nic,
        ResourceKind::FloatingIp,
        ResourceKind::Nat,
        ResourceKind::VpnService,
        ResourceKind::VpnSession,
        ResourceKind::Dhcp,
    ];

    /// ID prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Router => "rtr",
            Self::Network => "net",
            Self::Instance => "i",
            Self::Volume => "vol",
            Self::FirewallPolicy => "fwp",
            Self::FirewallRule => "fwr",
            Self::Nic => "nic",
            Self::FloatingIp => "fip",
            Self::Nat => "nat",
            Self::VpnService => "vpn",
            Self::VpnSession => "vpns",
            Self::Dhcp => "dhcp",
        }
    }

    /// Stable tag stored as the task/resource type discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Router => "router",
            Self::Network => "network",
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::FirewallPolicy => "firewall_policy",
            Self::FirewallRule => "firewall_rule",
            Self::Nic => "nic",
            Self::FloatingIp => "floating_ip",
            Self::Nat => "nat",
            Self::VpnService => "vpn_service",
            Self::VpnSession => "vpn_session",
            Self::Dhcp => "dhcp",
        }
    }

    /// Parse a stored type tag.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Resolve the kind of a resource from its ID prefix.
    pub fn from_id(id: &str) -> Result<Self, CoreError> {
        let prefix = id.rsplit_once('-').map(|(prefix, _)| prefix).unwrap_or("");
        Self::ALL
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
            .ok_or_else(|| CoreError::ValidationError {
                field: "resource_id".to_string(),
                message: format!("'{}' does not carry a known resource prefix", id),
            })
    }

    /// Generate a fresh ID for this kind.
    pub fn generate_id(&self) -> String {
        generate_id(self.prefix())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a `<prefix>-<8 hex>` identifier.
pub fn generate_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id_resolves_every_prefix() {
        for kind in ResourceKind::ALL {
            let id = kind.generate_id();
            assert_eq!(ResourceKind::from_id(&id).unwrap(), kind, "id {}", id);
        }
    }

    #[test]
    fn test_vpn_session_is_not_confused_with_vpn_service() {
        assert_eq!(
            ResourceKind::from_id("vpns-0a1b2c3d").unwrap(),
            ResourceKind::VpnSession
        );
        assert_eq!(
            ResourceKind::from_id("vpn-0a1b2c3d").unwrap(),
            ResourceKind::VpnService
        );
    }

    #[test]
    fn test_from_id_rejects_unknown_prefix() {
        let err = ResourceKind::from_id("xyz-12345678").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        assert!(ResourceKind::from_id("no_dash").is_err());
    }

    #[test]
    fn test_generated_id_shape() {
        let id = ResourceKind::Router.generate_id();
        let (prefix, hex) = id.split_once('-').unwrap();
        assert_eq!(prefix, "rtr");
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_all_follows_declaration_order() {
        assert!(ResourceKind::ALL.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ResourceKind::ALL[0], ResourceKind::Vpc);
        assert_eq!(ResourceKind::ALL[12], ResourceKind::Dhcp);
    }

    #[test]
    fn test_tag_round_trips() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("router"), Some(ResourceKind::Router));
        assert_eq!(ResourceKind::parse("Router"), None);
    }
}
