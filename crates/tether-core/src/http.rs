use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use tether_types::{
    Agent, Command, FileDiff, LspStatus, McpStatus, MessageWithParts, PathInfo,
    PermissionRequest, Project, ProviderAuth, ProviderCatalog, Session, SessionPatch,
    SessionStatus, Todo, VcsInfo,
};
use tether_wire::{drain_envelopes, EventEnvelope};

use crate::api::{EventSource, HealthInfo, ServerApi};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// `ServerApi` over the server's HTTP surface.
#[derive(Clone)]
pub struct HttpServerApi {
    base_url: String,
    http_client: Client,
    stream_client: Client,
}

fn default_headers(api_token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = api_token.map(str::trim).filter(|t| !t.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

impl HttpServerApi {
    pub fn new(base_url: &str, api_token: Option<&str>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .default_headers(default_headers(api_token))
            .timeout(timeout)
            .build()?;
        let stream_client = Client::builder()
            .default_headers(default_headers(api_token))
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            stream_client,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(
            &config.server_url,
            config.api_token.as_deref(),
            config.request_timeout,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, directory: Option<&str>) -> RequestBuilder {
        let req = self.http_client.get(self.url(path));
        match directory {
            Some(directory) => req.query(&[("directory", directory)]),
            None => req,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let response = req.send().await?;
        handle_response(response).await
    }

    async fn fetch_list<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Vec<T>> {
        let raw: Value = self.fetch(req).await?;
        decode_list(raw)
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await?;

    if status.is_success() {
        tracing::debug!("Response from {}: {}", url, preview(&body, 500));
        return serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to parse response from {}: {}", url, e);
            SyncError::Decode(format!("{}. Body: {}", e, preview(&body, 200)))
        });
    }

    if status == StatusCode::NOT_FOUND {
        tracing::debug!("Request to {} returned 404", url);
        return Err(SyncError::NotFound(if body.trim().is_empty() {
            url
        } else {
            body
        }));
    }

    tracing::warn!("Request to {} failed ({}): {}", url, status, preview(&body, 500));
    Err(SyncError::Http {
        status: status.as_u16(),
        body,
    })
}

fn preview(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Accepts a bare array or one wrapped in `items`, `sessions` or `data`.
/// Malformed entries are skipped.
fn decode_list<T: DeserializeOwned>(raw: Value) -> Result<Vec<T>> {
    fn decode_array<T: DeserializeOwned>(items: Vec<Value>) -> Vec<T> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<T>(item) {
                Ok(value) => out.push(value),
                Err(err) => tracing::debug!("Skipping malformed list entry: {}", err),
            }
        }
        out
    }

    match raw {
        Value::Array(items) => Ok(decode_array(items)),
        Value::Object(mut obj) => {
            for key in ["items", "sessions", "data"] {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return Ok(decode_array(items));
                }
            }
            Err(SyncError::Decode(
                "expected a list or an object wrapping one".to_string(),
            ))
        }
        Value::Null => Ok(Vec::new()),
        other => Err(SyncError::Decode(format!("expected a list, got {other}"))),
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn health(&self) -> Result<HealthInfo> {
        self.fetch(self.get("/global/health", None)).await
    }

    async fn path_get(&self, directory: Option<&str>) -> Result<PathInfo> {
        self.fetch(self.get("/path", directory)).await
    }

    async fn project_list(&self) -> Result<Vec<Project>> {
        self.fetch_list(self.get("/project", None)).await
    }

    async fn project_current(&self, directory: &str) -> Result<Project> {
        self.fetch(self.get("/project/current", Some(directory))).await
    }

    async fn provider_list(&self, directory: Option<&str>) -> Result<ProviderCatalog> {
        self.fetch(self.get("/provider", directory)).await
    }

    async fn provider_auth(&self) -> Result<ProviderAuth> {
        self.fetch(self.get("/provider/auth", None)).await
    }

    async fn app_agents(&self, directory: &str) -> Result<Vec<Agent>> {
        self.fetch_list(self.get("/agent", Some(directory))).await
    }

    async fn config_get(&self, directory: &str) -> Result<Value> {
        self.fetch(self.get("/config", Some(directory))).await
    }

    async fn command_list(&self, directory: &str) -> Result<Vec<Command>> {
        self.fetch_list(self.get("/command", Some(directory))).await
    }

    async fn session_list(&self, directory: &str, limit: Option<usize>) -> Result<Vec<Session>> {
        let mut req = self.get("/session", Some(directory));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        self.fetch_list(req).await
    }

    async fn session_get(&self, directory: &str, session_id: &str) -> Result<Session> {
        self.fetch(self.get(&format!("/session/{session_id}"), Some(directory)))
            .await
    }

    async fn session_status(&self, directory: &str) -> Result<HashMap<String, SessionStatus>> {
        self.fetch(self.get("/session/status", Some(directory))).await
    }

    async fn session_messages(
        &self,
        directory: &str,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>> {
        self.fetch_list(self.get(&format!("/session/{session_id}/message"), Some(directory)))
            .await
    }

    async fn session_todo(&self, directory: &str, session_id: &str) -> Result<Vec<Todo>> {
        self.fetch_list(self.get(&format!("/session/{session_id}/todo"), Some(directory)))
            .await
    }

    async fn session_diff(&self, directory: &str, session_id: &str) -> Result<Vec<FileDiff>> {
        self.fetch_list(self.get(&format!("/session/{session_id}/diff"), Some(directory)))
            .await
    }

    async fn session_update(
        &self,
        directory: &str,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<Session> {
        let req = self
            .http_client
            .patch(self.url(&format!("/session/{session_id}")))
            .query(&[("directory", directory)])
            .json(patch);
        self.fetch(req).await
    }

    async fn mcp_status(&self, directory: &str) -> Result<HashMap<String, McpStatus>> {
        self.fetch(self.get("/mcp", Some(directory))).await
    }

    async fn lsp_status(&self, directory: &str) -> Result<Vec<LspStatus>> {
        self.fetch_list(self.get("/lsp", Some(directory))).await
    }

    async fn vcs_get(&self, directory: &str) -> Result<VcsInfo> {
        self.fetch(self.get("/vcs", Some(directory))).await
    }

    async fn permission_list(&self, directory: &str) -> Result<Vec<PermissionRequest>> {
        self.fetch_list(self.get("/permission", Some(directory))).await
    }
}

#[async_trait]
impl EventSource for HttpServerApi {
    /// GET /global/event (SSE)
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<EventEnvelope>>> {
        let url = self.url("/global/event");
        tracing::debug!("Subscribing to events at: {}", url);

        let response = self
            .stream_client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http { status, body });
        }

        let stream = response.bytes_stream();
        let events = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            futures::pin_mut!(stream);

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        for envelope in drain_envelopes(&mut buffer) {
                            yield Ok(envelope);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("SSE stream error: {}", e);
                        yield Err(SyncError::Transport(format!("Stream error: {}", e)));
                        break;
                    }
                }
            }
            tracing::debug!("SSE stream ended");
        };
        Ok(events.boxed())
    }
}
