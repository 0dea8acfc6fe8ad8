// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote endpoint configuration from environment variables.

use std::time::Duration;

use ecloud_core::config::ConfigError;

/// One remote API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    /// Basic auth user.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
}

impl EndpointConfig {
    /// Endpoint without credentials.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
        }
    }

    /// Add basic auth credentials.
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Remote API configuration
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// NSX policy API
    pub nsx: EndpointConfig,
    /// Kingpin (VMware orchestration) API
    pub kingpin: EndpointConfig,
    /// Per-request timeout
    pub timeout: Duration,
    /// Tag scope stamped on NSX objects
    pub tag_scope: String,
    /// NSX edge cluster router locales are placed on
    pub edge_cluster_id: String,
}

impl RemoteConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ECLOUD_NSX_URL`: NSX manager base URL
    /// - `ECLOUD_KINGPIN_URL`: Kingpin base URL
    /// - `ECLOUD_EDGE_CLUSTER_ID`: NSX edge cluster ID
    ///
    /// Optional (with defaults):
    /// - `ECLOUD_NSX_USERNAME` / `ECLOUD_NSX_PASSWORD`: NSX basic auth
    /// - `ECLOUD_KINGPIN_USERNAME` / `ECLOUD_KINGPIN_PASSWORD`: Kingpin basic auth
    /// - `ECLOUD_REMOTE_TIMEOUT_SECS`: Request timeout (default: 30)
    /// - `ECLOUD_TAG_SCOPE`: NSX tag scope (default: ukfast)
    pub fn from_env() -> Result<Self, ConfigError> {
        let nsx = EndpointConfig {
            base_url: required("ECLOUD_NSX_URL")?,
            username: optional("ECLOUD_NSX_USERNAME"),
            password: optional("ECLOUD_NSX_PASSWORD"),
        };
        let kingpin = EndpointConfig {
            base_url: required("ECLOUD_KINGPIN_URL")?,
            username: optional("ECLOUD_KINGPIN_USERNAME"),
            password: optional("ECLOUD_KINGPIN_PASSWORD"),
        };

        let timeout_secs: u64 = optional("ECLOUD_REMOTE_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid("ECLOUD_REMOTE_TIMEOUT_SECS", "must be a number of seconds")
            })?
            .unwrap_or(30);

        Ok(Self {
            nsx,
            kingpin,
            timeout: Duration::from_secs(timeout_secs),
            tag_scope: optional("ECLOUD_TAG_SCOPE").unwrap_or_else(|| "ukfast".to_string()),
            edge_cluster_id: required("ECLOUD_EDGE_CLUSTER_ID")?,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
