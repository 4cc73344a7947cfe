//! The RPC surface the sync engine consumes.
//!
//! Directory-scoped calls take the directory as given by the caller; the
//! transport decides how to attach it to the request. Calls that also make
//! sense process-wide take `Option<&str>`.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_types::{
    Agent, Command, FileDiff, LspStatus, McpStatus, MessageWithParts, PathInfo,
    PermissionRequest, Project, ProviderAuth, ProviderCatalog, Session, SessionPatch,
    SessionStatus, Todo, VcsInfo,
};
use tether_wire::EventEnvelope;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthInfo {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn health(&self) -> Result<HealthInfo>;

    async fn path_get(&self, directory: Option<&str>) -> Result<PathInfo>;
    async fn project_list(&self) -> Result<Vec<Project>>;
    async fn project_current(&self, directory: &str) -> Result<Project>;
    async fn provider_list(&self, directory: Option<&str>) -> Result<ProviderCatalog>;
    async fn provider_auth(&self) -> Result<ProviderAuth>;

    async fn app_agents(&self, directory: &str) -> Result<Vec<Agent>>;
    async fn config_get(&self, directory: &str) -> Result<Value>;
    async fn command_list(&self, directory: &str) -> Result<Vec<Command>>;

    async fn session_list(&self, directory: &str, limit: Option<usize>) -> Result<Vec<Session>>;
    async fn session_get(&self, directory: &str, session_id: &str) -> Result<Session>;
    async fn session_status(&self, directory: &str) -> Result<HashMap<String, SessionStatus>>;
    async fn session_messages(
        &self,
        directory: &str,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>>;
    async fn session_todo(&self, directory: &str, session_id: &str) -> Result<Vec<Todo>>;
    async fn session_diff(&self, directory: &str, session_id: &str) -> Result<Vec<FileDiff>>;
    async fn session_update(
        &self,
        directory: &str,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<Session>;

    async fn mcp_status(&self, directory: &str) -> Result<HashMap<String, McpStatus>>;
    async fn lsp_status(&self, directory: &str) -> Result<Vec<LspStatus>>;
    async fn vcs_get(&self, directory: &str) -> Result<VcsInfo>;
    async fn permission_list(&self, directory: &str) -> Result<Vec<PermissionRequest>>;
}

/// A live, multiplexed event feed. Each call opens a fresh subscription.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<EventEnvelope>>>;
}
