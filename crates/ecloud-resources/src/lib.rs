// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! eCloud resources: the steps, chains and lifecycle reactions that
//! reconcile cloud resources with NSX and Kingpin.
//!
//! | Kind | Create | Delete |
//! |------|--------|--------|
//! | Router | tier-1 deploy, locale services, default rule | undeploy, poll until gone |
//! | Network | await router, segment deploy | undeploy, poll until gone |
//! | Volume | Kingpin deploy (records `vmware_uuid`) | undeploy |
//! | Instance | await network, deploy, NICs, power on | power off, undeploy |
//! | Firewall policy | await router, gateway policy deploy | undeploy |
//! | Firewall rule | gateway rule deploy (policy must be syncable) | undeploy |
//! | NAT | NAT rule deploy | undeploy |
//! | Floating IP | await NAT sync | await NAT sync |
//! | VPN session | IPsec session deploy | NO-SNAT teardown, await it, undeploy |
//!
//! [`steps`], [`chains`] and [`hooks`] build the registries an
//! [`EngineRuntime`](ecloud_core::EngineRuntime) is started with.

#![deny(missing_docs)]

/// Defaults shared by every kind.
pub mod defaults;
/// Firewall policies and rules.
pub mod firewall;
/// Floating IPs.
pub mod floating_ip;
/// Instances.
pub mod instance;
/// NAT rules.
pub mod nat;
/// Networks.
pub mod network;
mod props;
/// Routers.
pub mod router;
/// Volumes.
pub mod volume;
/// VPN sessions.
pub mod vpn_session;

use ecloud_core::chain::StepRegistry;
use ecloud_core::lifecycle::{HookRegistry, LifecycleEvent, ParentSyncGate};
use ecloud_core::registry::ChainRegistry;
use ecloud_core::resource::ResourceKind;
use ecloud_remote::{KingpinClient, NsxClient};

use crate::defaults::DefaultName;
use crate::firewall::{FirewallPolicyChains, FirewallRuleChains};
use crate::floating_ip::FloatingIpChains;
use crate::instance::DefaultPlatform;
use crate::nat::NatChains;
use crate::network::{DefaultSubnet, NetworkChains};
use crate::router::RouterChains;
use crate::volume::VolumeChains;
use crate::vpn_session::VpnSessionChains;

/// Kinds whose saves and deletes are synced to remote infrastructure.
pub const SYNCED_KINDS: [ResourceKind; 9] = [
    ResourceKind::Router,
    ResourceKind::Network,
    ResourceKind::Volume,
    ResourceKind::Instance,
    ResourceKind::FirewallPolicy,
    ResourceKind::FirewallRule,
    ResourceKind::Nat,
    ResourceKind::FloatingIp,
    ResourceKind::VpnSession,
];

/// Remote clients the steps call.
#[derive(Debug, Clone)]
pub struct Remotes {
    /// NSX policy API.
    pub nsx: NsxClient,
    /// Kingpin.
    pub kingpin: KingpinClient,
}

/// Every step, bound to `remotes`.
pub fn steps(remotes: &Remotes) -> StepRegistry {
    let nsx = &remotes.nsx;
    let kingpin = &remotes.kingpin;

    StepRegistry::new()
        .with(router::DeployRouter::new(nsx.clone()))
        .with(router::DeployRouterLocale::new(nsx.clone()))
        .with(router::DefaultFirewallRule::new(nsx.clone()))
        .with(router::UndeployRouter::new(nsx.clone()))
        .with(router::UndeployRouterCheck::new(nsx.clone()))
        .with(network::DeployNetwork::new(nsx.clone()))
        .with(network::UndeployNetwork::new(nsx.clone()))
        .with(network::UndeployNetworkCheck::new(nsx.clone()))
        .with(volume::DeployVolume::new(kingpin.clone()))
        .with(volume::VolumeCapacity::new(kingpin.clone()))
        .with(volume::UndeployVolume::new(kingpin.clone()))
        .with(instance::DeployInstance::new(kingpin.clone()))
        .with(instance::ConfigureNetworkAdapters::new(kingpin.clone()))
        .with(instance::PowerOn::new(kingpin.clone()))
        .with(instance::PowerOff::new(kingpin.clone()))
        .with(instance::ComputeUpdate::new(kingpin.clone()))
        .with(instance::UndeployInstance::new(kingpin.clone()))
        .with(firewall::DeployFirewallPolicy::new(nsx.clone()))
        .with(firewall::UndeployFirewallPolicy::new(nsx.clone()))
        .with(firewall::DeployFirewallRule::new(nsx.clone()))
        .with(firewall::UndeployFirewallRule::new(nsx.clone()))
        .with(nat::DeployNat::new(nsx.clone()))
        .with(nat::UndeployNat::new(nsx.clone()))
        .with(floating_ip::AwaitNatSync)
        .with(vpn_session::DeployVpnSession::new(nsx.clone()))
        .with(vpn_session::UndeployNoSnats)
        .with(vpn_session::UndeployVpnSession::new(nsx.clone()))
}

/// Sync chains and named tasks for every synced kind.
pub fn chains() -> ChainRegistry {
    let chains = ChainRegistry::new()
        .with(ResourceKind::Router, RouterChains)
        .with(ResourceKind::Network, NetworkChains)
        .with(ResourceKind::Volume, VolumeChains)
        .with(ResourceKind::FirewallPolicy, FirewallPolicyChains)
        .with(ResourceKind::FirewallRule, FirewallRuleChains)
        .with(ResourceKind::Nat, NatChains)
        .with(ResourceKind::FloatingIp, FloatingIpChains)
        .with(ResourceKind::VpnSession, VpnSessionChains);
    instance::register_chains(chains)
}

/// Lifecycle reactions: defaults on creation, parent gates, then sync for
/// [`SYNCED_KINDS`].
pub fn hooks() -> HookRegistry {
    let hooks = HookRegistry::new()
        .on_all(LifecycleEvent::Creating, DefaultName)
        .on(ResourceKind::Network, LifecycleEvent::Creating, DefaultSubnet)
        .on(ResourceKind::Instance, LifecycleEvent::Creating, DefaultPlatform)
        .on(
            ResourceKind::FirewallRule,
            LifecycleEvent::Saving,
            ParentSyncGate::new(firewall::POLICY_KEY),
        );

    SYNCED_KINDS
        .into_iter()
        .fold(hooks, |hooks, kind| hooks.with_sync(kind))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use ecloud_core::persistence::ResourceRecord;
    use ecloud_core::task::TaskType;
    use ecloud_remote::{EndpointConfig, HttpApi};
    use serde_json::json;

    #[test]
    fn test_every_synced_kind_has_chains_and_hooks() {
        let chains = chains();
        let hooks = hooks();
        for kind in SYNCED_KINDS {
            assert!(chains.has_factory(kind), "{} has no chain factory", kind);
            let saving: Vec<_> = hooks
                .handlers(kind, LifecycleEvent::Saving)
                .iter()
                .map(|r| r.name())
                .collect();
            assert_eq!(saving.last(), Some(&"sync_on_save"));
        }
        assert!(!chains.has_factory(ResourceKind::Vpc));
    }

    #[test]
    fn test_firewall_rule_gated_on_policy_before_sync() {
        let names: Vec<_> = hooks()
            .handlers(ResourceKind::FirewallRule, LifecycleEvent::Saving)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["parent_sync_gate", "sync_on_save"]);
    }

    fn unreachable_api() -> HttpApi {
        HttpApi::new(
            &EndpointConfig::new("http://127.0.0.1:1"),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_every_chained_step_is_registered() {
        let remotes = Remotes {
            nsx: NsxClient::new(unreachable_api(), "ukfast", "edge-1"),
            kingpin: KingpinClient::new(unreachable_api()),
        };
        let steps = steps(&remotes);
        let chains = chains();

        for kind in SYNCED_KINDS {
            let resource = ResourceRecord::new(kind, json!({ "router_id": "rtr-1" }));
            for task_type in [TaskType::Create, TaskType::Update, TaskType::Delete] {
                for spec in chains.sync_chain(&resource, task_type).unwrap() {
                    assert!(steps.contains(&spec.name), "{} not registered", spec.name);
                }
            }
        }
    }

    #[test]
    fn test_creating_reactions_order() {
        let names: Vec<_> = hooks()
            .handlers(ResourceKind::Network, LifecycleEvent::Creating)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["default_name", "default_subnet"]);
    }
}
