// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NSX policy API client.
//!
//! Routers map to tier-1 gateways, networks to segments under them. NAT
//! rules and VPN sessions live under the tier-1; firewall policies and their
//! rules are gateway policies in the default domain. Every object is tagged
//! `{scope: <tag scope>, tag: <vpc id>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::RemoteError;
use crate::http::HttpApi;

const INFRA: &str = "policy/api/v1/infra";

/// Tag identifying the tier-0 gateway routers attach to by default.
pub const DEFAULT_TIER0_TAG: &str = "az-default";

/// Gateway policy holding each router's default rule.
pub const DEFAULT_GATEWAY_POLICY: &str = "Policy_Default_Infra";

/// An NSX tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag scope.
    #[serde(default)]
    pub scope: String,
    /// Tag value.
    #[serde(default)]
    pub tag: String,
}

/// A gateway firewall rule as the policy API takes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRule {
    /// `ALLOW`, `DROP` or `REJECT`.
    pub action: String,
    /// `IN`, `OUT` or `IN_OUT`.
    pub direction: String,
    /// Evaluation order within the policy.
    pub sequence_number: u32,
    /// Source addresses; empty means `ANY`.
    pub sources: Vec<String>,
    /// Destination addresses; empty means `ANY`.
    pub destinations: Vec<String>,
}

/// A tier-1 NAT rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// `SNAT`, `DNAT` or `NOSNAT`.
    pub action: String,
    /// Matched source, if any.
    pub source_network: Option<String>,
    /// Matched destination, if any.
    pub destination_network: Option<String>,
    /// Rewritten address; absent for `NOSNAT`.
    pub translated_network: Option<String>,
    /// Evaluation order on the gateway.
    pub sequence_number: u32,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Tier0 {
    path: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

/// Client for the NSX policy API.
#[derive(Debug, Clone)]
pub struct NsxClient {
    api: HttpApi,
    tag_scope: String,
    edge_cluster_id: String,
}

impl NsxClient {
    /// Wrap an API handle.
    pub fn new(
        api: HttpApi,
        tag_scope: impl Into<String>,
        edge_cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            tag_scope: tag_scope.into(),
            edge_cluster_id: edge_cluster_id.into(),
        }
    }

    /// Tags stamped on objects owned by `vpc_id`.
    pub fn vpc_tags(&self, vpc_id: &str) -> Vec<Tag> {
        vec![Tag {
            scope: self.tag_scope.clone(),
            tag: vpc_id.to_string(),
        }]
    }

    /// Path of the tier-0 gateway tagged `<scope>/az-default`.
    pub async fn default_tier0_path(&self) -> Result<String, RemoteError> {
        let tier0s: ListResponse<Tier0> = self.api.get_json(&format!("{}/tier-0s", INFRA)).await?;

        tier0s
            .results
            .into_iter()
            .find(|t0| {
                t0.tags
                    .iter()
                    .any(|t| t.scope == self.tag_scope && t.tag == DEFAULT_TIER0_TAG)
            })
            .map(|t0| t0.path)
            .ok_or_else(|| {
                RemoteError::Decode(format!(
                    "No tier-0 gateway tagged '{}/{}'",
                    self.tag_scope, DEFAULT_TIER0_TAG
                ))
            })
    }

    fn tier1_path(router_id: &str) -> String {
        format!("{}/tier-1s/{}", INFRA, router_id)
    }

    /// Create or update the tier-1 gateway for a router.
    #[instrument(skip(self))]
    pub async fn put_tier1(
        &self,
        router_id: &str,
        vpc_id: &str,
        tier0_path: &str,
    ) -> Result<Value, RemoteError> {
        self.api
            .put_json(
                &Self::tier1_path(router_id),
                &json!({
                    "tier0_path": tier0_path,
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    /// The tier-1 gateway, or `None` once it is gone.
    pub async fn get_tier1(&self, router_id: &str) -> Result<Option<Value>, RemoteError> {
        self.api.get_optional(&Self::tier1_path(router_id)).await
    }

    /// Delete the tier-1 gateway; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_tier1(&self, router_id: &str) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::tier1_path(router_id))
            .await?
            .is_some())
    }

    /// Place the router's locale services on the configured edge cluster.
    #[instrument(skip(self))]
    pub async fn put_locale_services(
        &self,
        router_id: &str,
        vpc_id: &str,
    ) -> Result<Value, RemoteError> {
        let path = format!("{}/locale-services/{}", Self::tier1_path(router_id), router_id);
        self.api
            .put_json(
                &path,
                &json!({
                    "edge_cluster_path": format!(
                        "/infra/sites/default/enforcement-points/default/edge-clusters/{}",
                        self.edge_cluster_id
                    ),
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    fn default_rule_path(router_id: &str) -> String {
        format!(
            "{}/domains/default/gateway-policies/{}/rules/{}-tier1-default_blacklist_rule",
            INFRA, DEFAULT_GATEWAY_POLICY, router_id
        )
    }

    /// Switch the router's default gateway rule to REJECT.
    ///
    /// The rule is read back, system-owned `_`-prefixed keys are stripped and
    /// the result is patched.
    #[instrument(skip(self))]
    pub async fn reject_by_default(&self, router_id: &str) -> Result<Value, RemoteError> {
        let path = Self::default_rule_path(router_id);
        let rule: Value = self.api.get_json(&path).await?;
        let patch = rejecting_rule(rule);
        debug!(router_id, "Patching default gateway rule");
        self.api.patch_json(&path, &patch).await
    }

    fn segment_path(router_id: &str, network_id: &str) -> String {
        format!("{}/segments/{}", Self::tier1_path(router_id), network_id)
    }

    /// Create or update a segment under the router.
    #[instrument(skip(self))]
    pub async fn put_segment(
        &self,
        router_id: &str,
        network_id: &str,
        vpc_id: &str,
        gateway_address: &str,
    ) -> Result<Value, RemoteError> {
        self.api
            .put_json(
                &Self::segment_path(router_id, network_id),
                &json!({
                    "resource_type": "Segment",
                    "subnets": [{ "gateway_address": gateway_address }],
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    /// The segment, or `None` once it is gone.
    pub async fn get_segment(
        &self,
        router_id: &str,
        network_id: &str,
    ) -> Result<Option<Value>, RemoteError> {
        self.api
            .get_optional(&Self::segment_path(router_id, network_id))
            .await
    }

    /// Delete the segment; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_segment(
        &self,
        router_id: &str,
        network_id: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::segment_path(router_id, network_id))
            .await?
            .is_some())
    }

    fn gateway_policy_path(policy_id: &str) -> String {
        format!("{}/domains/default/gateway-policies/{}", INFRA, policy_id)
    }

    /// Create or update a gateway firewall policy.
    #[instrument(skip(self))]
    pub async fn put_gateway_policy(
        &self,
        policy_id: &str,
        vpc_id: &str,
        display_name: &str,
        sequence_number: u32,
    ) -> Result<Value, RemoteError> {
        self.api
            .put_json(
                &Self::gateway_policy_path(policy_id),
                &json!({
                    "display_name": display_name,
                    "category": "LocalGatewayRules",
                    "sequence_number": sequence_number,
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    /// Delete a gateway policy and its rules; `false` when it was already
    /// gone.
    #[instrument(skip(self))]
    pub async fn delete_gateway_policy(&self, policy_id: &str) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::gateway_policy_path(policy_id))
            .await?
            .is_some())
    }

    fn gateway_rule_path(policy_id: &str, rule_id: &str) -> String {
        format!("{}/rules/{}", Self::gateway_policy_path(policy_id), rule_id)
    }

    /// Create or update a rule in a gateway policy, scoped to the router's
    /// tier-1.
    #[instrument(skip(self, rule))]
    pub async fn put_gateway_rule(
        &self,
        policy_id: &str,
        rule_id: &str,
        router_id: &str,
        vpc_id: &str,
        rule: &GatewayRule,
    ) -> Result<Value, RemoteError> {
        self.api
            .put_json(
                &Self::gateway_rule_path(policy_id, rule_id),
                &json!({
                    "action": rule.action,
                    "direction": rule.direction,
                    "sequence_number": rule.sequence_number,
                    "source_groups": any_if_empty(&rule.sources),
                    "destination_groups": any_if_empty(&rule.destinations),
                    "services": ["ANY"],
                    "scope": [format!("/infra/tier-1s/{}", router_id)],
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    /// Delete a gateway rule; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_gateway_rule(
        &self,
        policy_id: &str,
        rule_id: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::gateway_rule_path(policy_id, rule_id))
            .await?
            .is_some())
    }

    fn nat_rule_path(router_id: &str, nat_id: &str) -> String {
        format!("{}/nat/USER/nat-rules/{}", Self::tier1_path(router_id), nat_id)
    }

    /// Create or update a NAT rule on the router's tier-1.
    #[instrument(skip(self, rule))]
    pub async fn put_nat_rule(
        &self,
        router_id: &str,
        nat_id: &str,
        vpc_id: &str,
        rule: &NatRule,
    ) -> Result<Value, RemoteError> {
        let mut body = json!({
            "action": rule.action,
            "sequence_number": rule.sequence_number,
            "enabled": true,
            "logging": false,
            "firewall_match": "MATCH_INTERNAL_ADDRESS",
            "tags": self.vpc_tags(vpc_id),
        });
        let optional = [
            ("source_network", &rule.source_network),
            ("destination_network", &rule.destination_network),
            ("translated_network", &rule.translated_network),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                body[key] = Value::String(value.clone());
            }
        }

        self.api
            .put_json(&Self::nat_rule_path(router_id, nat_id), &body)
            .await
    }

    /// Delete a NAT rule; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_nat_rule(
        &self,
        router_id: &str,
        nat_id: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::nat_rule_path(router_id, nat_id))
            .await?
            .is_some())
    }

    fn vpn_session_path(router_id: &str, vpn_service_id: &str, session_id: &str) -> String {
        format!(
            "{}/locale-services/{}/ipsec-vpn-services/{}/sessions/{}",
            Self::tier1_path(router_id),
            router_id,
            vpn_service_id,
            session_id
        )
    }

    /// Create or update a policy-based IPsec session under a VPN service.
    #[instrument(skip(self))]
    pub async fn put_vpn_session(
        &self,
        router_id: &str,
        vpn_service_id: &str,
        session_id: &str,
        vpc_id: &str,
        peer_address: &str,
    ) -> Result<Value, RemoteError> {
        self.api
            .put_json(
                &Self::vpn_session_path(router_id, vpn_service_id, session_id),
                &json!({
                    "resource_type": "PolicyBasedIPSecVpnSession",
                    "peer_address": peer_address,
                    "peer_id": peer_address,
                    "enabled": true,
                    "tags": self.vpc_tags(vpc_id),
                }),
            )
            .await
    }

    /// Delete an IPsec session; `false` when it was already gone.
    #[instrument(skip(self))]
    pub async fn delete_vpn_session(
        &self,
        router_id: &str,
        vpn_service_id: &str,
        session_id: &str,
    ) -> Result<bool, RemoteError> {
        Ok(self
            .api
            .delete_optional(&Self::vpn_session_path(router_id, vpn_service_id, session_id))
            .await?
            .is_some())
    }

    /// Run a policy search query, returning the matching objects.
    pub async fn search(&self, query: &str) -> Result<Vec<Value>, RemoteError> {
        let response: ListResponse<Value> = self
            .api
            .get_json_with_query("policy/api/v1/search/query", &[("query", query)])
            .await?;
        Ok(response.results)
    }
}

fn any_if_empty(addresses: &[String]) -> Vec<String> {
    if addresses.is_empty() {
        vec!["ANY".to_string()]
    } else {
        addresses.to_vec()
    }
}

fn rejecting_rule(rule: Value) -> Value {
    let mut fields = match rule {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    fields.retain(|key, _| !key.starts_with('_'));
    fields.insert("action".to_string(), Value::String("REJECT".to_string()));
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EndpointConfig;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> NsxClient {
        let api = HttpApi::new(&EndpointConfig::new(server.uri()), Duration::from_secs(5)).unwrap();
        NsxClient::new(api, "ukfast", "edge-1")
    }

    #[test]
    fn test_rejecting_rule_strips_system_keys() {
        let rule = json!({
            "action": "ALLOW",
            "sequence_number": 10,
            "_revision": 3,
            "_create_user": "system",
        });
        assert_eq!(
            rejecting_rule(rule),
            json!({ "action": "REJECT", "sequence_number": 10 })
        );
    }

    #[tokio::test]
    async fn test_default_tier0_matches_scope_and_tag() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policy/api/v1/infra/tier-0s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {
                        "path": "/infra/tier-0s/other",
                        "tags": [{ "scope": "other", "tag": "az-default" }],
                    },
                    {
                        "path": "/infra/tier-0s/t0",
                        "tags": [{ "scope": "ukfast", "tag": "az-default" }],
                    },
                ]
            })))
            .mount(&mock_server)
            .await;

        let path = client(&mock_server).default_tier0_path().await.unwrap();
        assert_eq!(path, "/infra/tier-0s/t0");
    }

    #[tokio::test]
    async fn test_missing_default_tier0_is_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policy/api/v1/infra/tier-0s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server).default_tier0_path().await.unwrap_err();
        assert!(err.to_string().contains("ukfast/az-default"));
    }

    #[tokio::test]
    async fn test_put_tier1_tags_vpc() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/policy/api/v1/infra/tier-1s/rtr-1"))
            .and(body_json(json!({
                "tier0_path": "/infra/tier-0s/t0",
                "tags": [{ "scope": "ukfast", "tag": "vpc-1" }],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rtr-1" })))
            .expect(1)
            .mount(&mock_server)
            .await;

        client(&mock_server)
            .put_tier1("rtr-1", "vpc-1", "/infra/tier-0s/t0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_tier1_reports_already_gone() {
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/policy/api/v1/infra/tier-1s/rtr-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        assert!(!client(&mock_server).delete_tier1("rtr-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_gateway_rule_scopes_to_router() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(
                "/policy/api/v1/infra/domains/default/gateway-policies/fwp-1/rules/fwr-1",
            ))
            .and(body_json(json!({
                "action": "ALLOW",
                "direction": "IN",
                "sequence_number": 5,
                "source_groups": ["10.0.0.0/24"],
                "destination_groups": ["ANY"],
                "services": ["ANY"],
                "scope": ["/infra/tier-1s/rtr-1"],
                "tags": [{ "scope": "ukfast", "tag": "vpc-1" }],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "fwr-1" })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let rule = GatewayRule {
            action: "ALLOW".to_string(),
            direction: "IN".to_string(),
            sequence_number: 5,
            sources: vec!["10.0.0.0/24".to_string()],
            destinations: Vec::new(),
        };
        client(&mock_server)
            .put_gateway_rule("fwp-1", "fwr-1", "rtr-1", "vpc-1", &rule)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_nat_rule_omits_unset_networks() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/policy/api/v1/infra/tier-1s/rtr-1/nat/USER/nat-rules/nat-1"))
            .and(body_json(json!({
                "action": "NOSNAT",
                "sequence_number": 0,
                "enabled": true,
                "logging": false,
                "firewall_match": "MATCH_INTERNAL_ADDRESS",
                "source_network": "10.0.0.0/24",
                "destination_network": "192.168.0.0/24",
                "tags": [{ "scope": "ukfast", "tag": "vpc-1" }],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "nat-1" })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let rule = NatRule {
            action: "NOSNAT".to_string(),
            source_network: Some("10.0.0.0/24".to_string()),
            destination_network: Some("192.168.0.0/24".to_string()),
            translated_network: None,
            sequence_number: 0,
        };
        client(&mock_server)
            .put_nat_rule("rtr-1", "nat-1", "vpc-1", &rule)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_vpn_session_path() {
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(
                "/policy/api/v1/infra/tier-1s/rtr-1/locale-services/rtr-1\
                 /ipsec-vpn-services/vpn-1/sessions/vpns-1",
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(client(&mock_server)
            .delete_vpn_session("rtr-1", "vpn-1", "vpns-1")
            .await
            .unwrap());
    }
}
