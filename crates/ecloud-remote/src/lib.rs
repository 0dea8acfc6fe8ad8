// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote infrastructure collaborators for the eCloud control plane.
//!
//! Two JSON APIs are reconciled against:
//!
//! - [`NsxClient`]: the NSX policy API (tier-1 gateways, segments, NAT
//!   rules, IPsec sessions, gateway firewall policies and rules).
//! - [`KingpinClient`]: Kingpin, which fronts vCenter (VMs, volumes, power).
//!
//! Every call either succeeds or returns a [`RemoteError`]: 4xx and 5xx keep
//! the status and body verbatim, transport failures carry the client's
//! message. A 404 on lookup or teardown is surfaced as "does not exist"
//! through the `*_optional` helpers rather than as an error.
//!
//! `RemoteError` converts into a step error, so chain steps can use `?` and
//! the remote's explanation becomes the task's failure reason.

#![deny(missing_docs)]

/// Endpoint configuration.
pub mod config;
/// Remote error model.
pub mod error;
/// JSON-over-HTTP plumbing.
pub mod http;
/// Kingpin client.
pub mod kingpin;
/// NSX policy API client.
pub mod nsx;

pub use config::{EndpointConfig, RemoteConfig};
pub use error::RemoteError;
pub use http::HttpApi;
pub use kingpin::{InstanceDeploy, InstanceShape, KingpinClient};
pub use nsx::{GatewayRule, NatRule, NsxClient};

/// Build both clients from configuration.
pub fn clients(config: &RemoteConfig) -> Result<(NsxClient, KingpinClient), RemoteError> {
    let nsx = NsxClient::new(
        HttpApi::new(&config.nsx, config.timeout)?,
        config.tag_scope.clone(),
        config.edge_cluster_id.clone(),
    );
    let kingpin = KingpinClient::new(HttpApi::new(&config.kingpin, config.timeout)?);
    Ok((nsx, kingpin))
}
