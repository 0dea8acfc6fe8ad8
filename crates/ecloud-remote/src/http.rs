// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-over-HTTP plumbing shared by the remote clients.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::error::RemoteError;

/// A remote JSON API rooted at one base URL.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, Option<String>)>,
}

impl HttpApi {
    /// Build a client for `endpoint` with a per-request timeout.
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            auth: endpoint
                .username
                .clone()
                .map(|user| (user, endpoint.password.clone())),
        })
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        match &self.auth {
            Some((user, password)) => request.basic_auth(user, password.as_deref()),
            None => request,
        }
    }

    /// GET and decode.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self.send(self.request(Method::GET, path), path).await?;
        decode(response).await
    }

    /// GET with query parameters and decode.
    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let request = self.request(Method::GET, path).query(query);
        let response = self.send(request, path).await?;
        decode(response).await
    }

    /// GET and decode; `None` on 404.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, RemoteError> {
        match self.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PUT a JSON body.
    pub async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, RemoteError> {
        let response = self
            .send(self.request(Method::PUT, path).json(body), path)
            .await?;
        decode(response).await
    }

    /// PATCH a JSON body.
    pub async fn patch_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, RemoteError> {
        let response = self
            .send(self.request(Method::PATCH, path).json(body), path)
            .await?;
        decode(response).await
    }

    /// POST a JSON body and decode the response.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self
            .send(self.request(Method::POST, path).json(body), path)
            .await?;
        decode(response).await
    }

    /// DELETE.
    pub async fn delete(&self, path: &str) -> Result<Value, RemoteError> {
        let response = self.send(self.request(Method::DELETE, path), path).await?;
        decode(response).await
    }

    /// DELETE; `None` when the remote object is already gone.
    pub async fn delete_optional(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        match self.delete(path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Response, RemoteError> {
        let response = request.send().await?;
        let status = response.status();
        debug!(base_url = %self.base_url, path, status = status.as_u16(), "Remote call");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

/// Decode a body, treating an empty one as JSON `null`.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpApi {
        HttpApi::new(&EndpointConfig::new(server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_json_decodes_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policy/api/v1/infra/tier-0s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(&mock_server)
            .await;

        let body: Value = api(&mock_server)
            .get_json("policy/api/v1/infra/tier-0s")
            .await
            .unwrap();
        assert_eq!(body, json!({ "results": [] }));
    }

    #[tokio::test]
    async fn test_basic_auth_header_is_sent() {
        let mock_server = MockServer::start().await;
        // admin:secret
        Mock::given(method("GET"))
            .and(path("/status"))
            .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&mock_server)
            .await;

        let endpoint = EndpointConfig::new(format!("{}/", mock_server.uri()))
            .with_basic_auth("admin", "secret");
        let api = HttpApi::new(&endpoint, Duration::from_secs(5)).unwrap();
        let body: Value = api.get_json("/status").await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_query_parameters() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policy/api/v1/search/query"))
            .and(query_param("query", "resource_type:Segment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result_count": 0 })))
            .mount(&mock_server)
            .await;

        let body: Value = api(&mock_server)
            .get_json_with_query(
                "policy/api/v1/search/query",
                &[("query", "resource_type:Segment")],
            )
            .await
            .unwrap();
        assert_eq!(body["result_count"], 0);
    }

    #[tokio::test]
    async fn test_error_status_keeps_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/policy/api/v1/infra/tier-1s/rtr-1"))
            .and(body_json(json!({ "tier0_path": "/infra/tier-0s/t0" })))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let err = api(&mock_server)
            .put_json(
                "policy/api/v1/infra/tier-1s/rtr-1",
                &json!({ "tier0_path": "/infra/tier-0s/t0" }),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Server {
                status: 500,
                body: "Internal Server Error".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_not_found_helpers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let api = api(&mock_server);
        let missing: Option<Value> = api.get_optional("missing").await.unwrap();
        assert!(missing.is_none());
        assert!(api.delete_optional("missing").await.unwrap().is_none());
        assert_eq!(api.delete_optional("present").await.unwrap(), Some(Value::Null));
    }
}
