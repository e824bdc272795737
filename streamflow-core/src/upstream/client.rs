//! Upstream orchestrator HTTP client.
//!
//! Thin typed wrapper over the orchestrator's REST API. Authentication is a
//! bearer token obtained from the login endpoint; a 401 triggers one
//! re-login before the call is surfaced as an error. Transient failures
//! (5xx, connect errors, timeouts) are retried with exponential backoff.
//! Callers must never hold a subsystem lock across these calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::models::{
    parse_proxy_status, Channel, ChannelGroup, ChannelProfile, M3uAccount, ProxyChannelStatus,
    Stream,
};
use crate::resilience::retry;
use crate::{Error, Result};

/// Operations the scheduler core needs from the upstream orchestrator.
///
/// The pipeline and scheduler depend on this trait, not the concrete client,
/// so tests can substitute a fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn list_channel_groups(&self) -> Result<Vec<ChannelGroup>>;
    async fn list_streams(&self) -> Result<Vec<Stream>>;
    async fn list_m3u_accounts(&self) -> Result<Vec<M3uAccount>>;
    async fn list_profiles(&self) -> Result<Vec<ChannelProfile>>;

    /// Merge-patch a stream's `stream_stats`; the caller supplies the merged
    /// object so upstream keys it does not own are preserved.
    async fn patch_stream_stats(&self, stream_id: i64, stats: Value) -> Result<()>;

    /// Reorder or set a channel's stream association
    async fn set_channel_streams(&self, channel_id: i64, stream_ids: Vec<i64>) -> Result<()>;

    /// Toggle one channel's enabled flag within a profile
    async fn set_profile_channel_enabled(
        &self,
        profile_id: i64,
        channel_id: i64,
        enabled: bool,
    ) -> Result<()>;

    /// Ask the upstream to refresh one M3U account's playlist
    async fn refresh_m3u_account(&self, account_id: i64) -> Result<()>;

    /// Active proxy channels keyed by channel_id
    async fn proxy_status(&self) -> Result<HashMap<String, ProxyChannelStatus>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
}

/// Concrete reqwest-backed client
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String> {
        debug!("Logging in to upstream");
        let response = self
            .http
            .post(self.url("/api/accounts/token/"))
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Authentication(format!(
                "login failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        *self.token.write().await = Some(token.access.clone());
        Ok(token.access)
    }

    async fn current_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// One authenticated request with a single re-login on 401
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut token = self.current_token().await?;

        for attempt in 0..2 {
            let mut request = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(path, "Token rejected, re-authenticating");
                token = self.login().await?;
                continue;
            }
            if response.status().is_success() {
                return Ok(response);
            }
            return Err(Error::UpstreamStatus {
                status: response.status(),
                context: format!("{method} {path}"),
            });
        }

        Err(Error::Authentication(format!(
            "unauthorized after re-login: {method} {path}"
        )))
    }

    /// Authenticated request with transient-failure retries
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let operation = || async { self.send_once(method.clone(), path, body.as_ref()).await };
        operation
            .retry(retry::upstream_backoff())
            .when(retry::should_retry)
            .notify(|err: &Error, delay: Duration| {
                warn!(path, error = %err, delay_ms = delay.as_millis() as u64, "Retrying upstream call");
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    /// Parse a list endpoint that may answer either a bare array or a
    /// paginated `{"results": [...]}` envelope.
    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let value: Value = self.get_json(path).await?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("results") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(Error::Internal(format!(
                        "unexpected list payload from {path}"
                    )))
                }
            },
            _ => {
                return Err(Error::Internal(format!(
                    "unexpected list payload from {path}"
                )))
            }
        };
        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.get_list("/api/channels/channels/").await
    }

    async fn list_channel_groups(&self) -> Result<Vec<ChannelGroup>> {
        self.get_list("/api/channels/groups/").await
    }

    async fn list_streams(&self) -> Result<Vec<Stream>> {
        self.get_list("/api/channels/streams/").await
    }

    async fn list_m3u_accounts(&self) -> Result<Vec<M3uAccount>> {
        self.get_list("/api/m3u/accounts/").await
    }

    async fn list_profiles(&self) -> Result<Vec<ChannelProfile>> {
        self.get_list("/api/channels/profiles/").await
    }

    async fn patch_stream_stats(&self, stream_id: i64, stats: Value) -> Result<()> {
        let path = format!("/api/channels/streams/{stream_id}/");
        self.send(
            Method::PATCH,
            &path,
            Some(json!({ "stream_stats": stats })),
        )
        .await?;
        Ok(())
    }

    async fn set_channel_streams(&self, channel_id: i64, stream_ids: Vec<i64>) -> Result<()> {
        let path = format!("/api/channels/channels/{channel_id}/");
        self.send(Method::PATCH, &path, Some(json!({ "streams": stream_ids })))
            .await?;
        Ok(())
    }

    async fn set_profile_channel_enabled(
        &self,
        profile_id: i64,
        channel_id: i64,
        enabled: bool,
    ) -> Result<()> {
        let path = format!("/api/channels/profiles/{profile_id}/channels/{channel_id}/");
        self.send(Method::PATCH, &path, Some(json!({ "enabled": enabled })))
            .await?;
        Ok(())
    }

    async fn refresh_m3u_account(&self, account_id: i64) -> Result<()> {
        let path = format!("/api/m3u/accounts/{account_id}/refresh/");
        self.send(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn proxy_status(&self) -> Result<HashMap<String, ProxyChannelStatus>> {
        let payload: Value = self.get_json("/proxy/ts/status").await?;
        Ok(parse_proxy_status(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> UpstreamConfig {
        UpstreamConfig {
            base_url: server.uri(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            http_timeout_seconds: 5,
            user_agent: "StreamFlow/0.1".to_string(),
        }
    }

    async fn mock_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/accounts/token/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "tok-1"})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_channels_with_bearer_token() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "News HD", "streams": [101, 102]}
            ])))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        let channels = client.list_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].streams, vec![101, 102]);
    }

    #[tokio::test]
    async fn test_list_accepts_paginated_envelope() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/channels/streams/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 1,
                "results": [{"id": 5, "name": "Feed", "url": "http://x/5"}]
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        let streams = client.list_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].url, "http://x/5");
    }

    #[tokio::test]
    async fn test_relogin_on_unauthorized() {
        let server = MockServer::start().await;
        // First token is rejected once, then accepted
        Mock::given(method("POST"))
            .and(path("/api/accounts/token/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "tok-2"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        let channels = client.list_channels().await.unwrap();
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        assert!(client.list_channels().await.is_ok());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/channels/channels/"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        let err = client.list_channels().await.unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { .. }));
    }

    #[tokio::test]
    async fn test_patch_stream_stats_wraps_payload() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("PATCH"))
            .and(path("/api/channels/streams/42/"))
            .and(body_partial_json(json!({
                "stream_stats": {"resolution": "1920x1080", "custom_tag": "keep-me"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        client
            .patch_stream_stats(
                42,
                json!({"resolution": "1920x1080", "custom_tag": "keep-me"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_proxy_status_keyed_by_channel_id() {
        let server = MockServer::start().await;
        mock_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/proxy/ts/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "channels": [
                    {"channel_id": "uuid-1", "state": "active", "client_count": 2},
                    {"state": "orphan"}
                ],
                "count": 2
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server)).unwrap();
        let status = client.proxy_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status["uuid-1"].client_count, Some(2));
    }
}
