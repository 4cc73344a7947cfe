//! Scriptable in-memory server for engine tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tether_types::{
    Agent, Command, FileDiff, LspStatus, McpStatus, MessageWithParts, PathInfo,
    PermissionRequest, Project, ProviderAuth, ProviderCatalog, Session, SessionPatch,
    SessionStatus, Todo, VcsInfo,
};
use tether_wire::EventEnvelope;

use crate::api::{EventSource, HealthInfo, ServerApi};
use crate::error::{Result, SyncError};
use crate::notify::{NotificationSink, Toast};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Health,
    PathGet,
    ProjectList,
    ProjectCurrent,
    ProviderList,
    ProviderAuth,
    AppAgents,
    ConfigGet,
    CommandList,
    SessionList,
    SessionGet,
    SessionStatus,
    SessionMessages,
    SessionTodo,
    SessionDiff,
    SessionUpdate,
    McpStatus,
    LspStatus,
    VcsGet,
    PermissionList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    NotFound,
    Rejected,
}

impl Failure {
    fn error(self, endpoint: Endpoint) -> SyncError {
        match self {
            Failure::Transient => SyncError::Transport(format!("{endpoint:?} unreachable")),
            Failure::NotFound => SyncError::NotFound(format!("{endpoint:?}")),
            Failure::Rejected => SyncError::Http {
                status: 400,
                body: format!("{endpoint:?} rejected"),
            },
        }
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 2,
        initial_delay: Duration::from_millis(1),
        factor: 2,
        max_delay: Duration::from_millis(2),
    }
}

pub fn session(id: &str, directory: Option<&str>, updated: u64) -> Session {
    let mut session = Session::new(id);
    session.title = format!("title {id}");
    session.directory = directory.map(str::to_string);
    session.time.created = updated;
    session.time.updated = updated;
    session
}

pub fn permission(id: &str, session_id: &str) -> PermissionRequest {
    PermissionRequest {
        id: id.to_string(),
        session_id: session_id.to_string(),
        permission: "bash".to_string(),
        patterns: vec!["*".to_string()],
        metadata: Default::default(),
        tool: None,
    }
}

#[derive(Default)]
struct FakeData {
    healthy: bool,
    projects: Vec<Project>,
    current: HashMap<String, Project>,
    sessions: HashMap<String, Vec<Session>>,
    statuses: HashMap<String, SessionStatus>,
    messages: HashMap<String, Vec<MessageWithParts>>,
    todos: HashMap<String, Vec<Todo>>,
    diffs: HashMap<String, Vec<FileDiff>>,
    permissions: HashMap<String, Vec<PermissionRequest>>,
    lsp: Vec<LspStatus>,
    vcs: VcsInfo,
    provider: ProviderCatalog,
}

/// In-memory `ServerApi`. Per-directory data is keyed by the directory
/// string exactly as the engine sends it.
pub struct FakeServer {
    data: Mutex<FakeData>,
    failures: Mutex<HashMap<Endpoint, Failure>>,
    delays: Mutex<HashMap<Endpoint, Duration>>,
    calls: Mutex<HashMap<Endpoint, usize>>,
    last_limit: Mutex<Option<usize>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        let provider: ProviderCatalog = serde_json::from_value(json!({
            "all": [{
                "id": "anthropic",
                "name": "Anthropic",
                "models": {
                    "legacy": {"id": "legacy", "name": "Legacy", "status": "deprecated"},
                    "current": {"id": "current", "name": "Current"}
                }
            }],
            "connected": ["anthropic"],
            "default": {"anthropic": "current"}
        }))
        .expect("provider fixture");

        Self {
            data: Mutex::new(FakeData {
                healthy: true,
                provider,
                ..FakeData::default()
            }),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            last_limit: Mutex::new(None),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.data.lock().healthy = healthy;
    }

    pub fn set_projects(&self, projects: Vec<Project>) {
        self.data.lock().projects = projects;
    }

    pub fn set_current_project(&self, directory: &str, project: Project) {
        self.data.lock().current.insert(directory.to_string(), project);
    }

    pub fn set_sessions(&self, directory: &str, sessions: Vec<Session>) {
        self.data.lock().sessions.insert(directory.to_string(), sessions);
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<MessageWithParts>) {
        self.data.lock().messages.insert(session_id.to_string(), messages);
    }

    pub fn set_todos(&self, session_id: &str, todos: Vec<Todo>) {
        self.data.lock().todos.insert(session_id.to_string(), todos);
    }

    pub fn set_diffs(&self, session_id: &str, diffs: Vec<FileDiff>) {
        self.data.lock().diffs.insert(session_id.to_string(), diffs);
    }

    pub fn set_permissions(&self, directory: &str, permissions: Vec<PermissionRequest>) {
        self.data
            .lock()
            .permissions
            .insert(directory.to_string(), permissions);
    }

    pub fn set_lsp(&self, lsp: Vec<LspStatus>) {
        self.data.lock().lsp = lsp;
    }

    pub fn set_branch(&self, branch: &str) {
        self.data.lock().vcs = VcsInfo {
            branch: Some(branch.to_string()),
        };
    }

    pub fn fail_always(&self, endpoint: Endpoint) {
        self.fail_with(endpoint, Failure::Transient);
    }

    pub fn fail_with(&self, endpoint: Endpoint, failure: Failure) {
        self.failures.lock().insert(endpoint, failure);
    }

    pub fn recover(&self, endpoint: Endpoint) {
        self.failures.lock().remove(&endpoint);
    }

    pub fn delay(&self, endpoint: Endpoint, delay: Duration) {
        self.delays.lock().insert(endpoint, delay);
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls.lock().get(&endpoint).copied().unwrap_or(0)
    }

    pub fn last_session_limit(&self) -> Option<usize> {
        *self.last_limit.lock()
    }

    async fn enter(&self, endpoint: Endpoint) -> Result<()> {
        *self.calls.lock().entry(endpoint).or_default() += 1;
        let delay = self.delays.lock().get(&endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().get(&endpoint).copied();
        match failure {
            Some(failure) => Err(failure.error(endpoint)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn health(&self) -> Result<HealthInfo> {
        self.enter(Endpoint::Health).await?;
        Ok(HealthInfo {
            healthy: self.data.lock().healthy,
            version: Some("test".to_string()),
        })
    }

    async fn path_get(&self, directory: Option<&str>) -> Result<PathInfo> {
        self.enter(Endpoint::PathGet).await?;
        Ok(PathInfo {
            home: "/home/me".to_string(),
            state: "/home/me/.local/state/tether".to_string(),
            config: "/home/me/.config/tether".to_string(),
            worktree: directory.unwrap_or("/home/me").to_string(),
            directory: directory.unwrap_or("/home/me").to_string(),
        })
    }

    async fn project_list(&self) -> Result<Vec<Project>> {
        self.enter(Endpoint::ProjectList).await?;
        Ok(self.data.lock().projects.clone())
    }

    async fn project_current(&self, directory: &str) -> Result<Project> {
        self.enter(Endpoint::ProjectCurrent).await?;
        let data = self.data.lock();
        Ok(data.current.get(directory).cloned().unwrap_or_else(|| {
            Project::new(
                format!("prj_{}", crate::path::display_name(directory)),
                directory,
            )
        }))
    }

    async fn provider_list(&self, _directory: Option<&str>) -> Result<ProviderCatalog> {
        self.enter(Endpoint::ProviderList).await?;
        Ok(self.data.lock().provider.clone())
    }

    async fn provider_auth(&self) -> Result<ProviderAuth> {
        self.enter(Endpoint::ProviderAuth).await?;
        Ok(ProviderAuth::new())
    }

    async fn app_agents(&self, _directory: &str) -> Result<Vec<Agent>> {
        self.enter(Endpoint::AppAgents).await?;
        Ok(vec![serde_json::from_value(json!({"name": "build", "mode": "primary"}))
            .expect("agent fixture")])
    }

    async fn config_get(&self, _directory: &str) -> Result<Value> {
        self.enter(Endpoint::ConfigGet).await?;
        Ok(json!({"model": "anthropic/current"}))
    }

    async fn command_list(&self, _directory: &str) -> Result<Vec<Command>> {
        self.enter(Endpoint::CommandList).await?;
        Ok(vec![Command {
            name: "init".to_string(),
            description: None,
            agent: None,
            template: None,
        }])
    }

    async fn session_list(&self, directory: &str, limit: Option<usize>) -> Result<Vec<Session>> {
        self.enter(Endpoint::SessionList).await?;
        *self.last_limit.lock() = limit;
        Ok(self
            .data
            .lock()
            .sessions
            .get(directory)
            .cloned()
            .unwrap_or_default())
    }

    async fn session_get(&self, directory: &str, session_id: &str) -> Result<Session> {
        self.enter(Endpoint::SessionGet).await?;
        self.data
            .lock()
            .sessions
            .get(directory)
            .and_then(|list| list.iter().find(|s| s.id == session_id).cloned())
            .ok_or_else(|| SyncError::NotFound(session_id.to_string()))
    }

    async fn session_status(&self, _directory: &str) -> Result<HashMap<String, SessionStatus>> {
        self.enter(Endpoint::SessionStatus).await?;
        Ok(self.data.lock().statuses.clone())
    }

    async fn session_messages(
        &self,
        _directory: &str,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>> {
        self.enter(Endpoint::SessionMessages).await?;
        Ok(self
            .data
            .lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn session_todo(&self, _directory: &str, session_id: &str) -> Result<Vec<Todo>> {
        self.enter(Endpoint::SessionTodo).await?;
        Ok(self.data.lock().todos.get(session_id).cloned().unwrap_or_default())
    }

    async fn session_diff(&self, _directory: &str, session_id: &str) -> Result<Vec<FileDiff>> {
        self.enter(Endpoint::SessionDiff).await?;
        Ok(self.data.lock().diffs.get(session_id).cloned().unwrap_or_default())
    }

    async fn session_update(
        &self,
        directory: &str,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<Session> {
        self.enter(Endpoint::SessionUpdate).await?;
        let mut data = self.data.lock();
        let session = data
            .sessions
            .get_mut(directory)
            .and_then(|list| list.iter_mut().find(|s| s.id == session_id))
            .ok_or_else(|| SyncError::NotFound(session_id.to_string()))?;
        if let Some(title) = &patch.title {
            session.title = title.clone();
        }
        if let Some(archived) = patch.time.as_ref().and_then(|t| t.archived) {
            session.time.archived = Some(archived);
        }
        Ok(session.clone())
    }

    async fn mcp_status(&self, _directory: &str) -> Result<HashMap<String, McpStatus>> {
        self.enter(Endpoint::McpStatus).await?;
        Ok(HashMap::from([("github".to_string(), McpStatus::Connected)]))
    }

    async fn lsp_status(&self, _directory: &str) -> Result<Vec<LspStatus>> {
        self.enter(Endpoint::LspStatus).await?;
        Ok(self.data.lock().lsp.clone())
    }

    async fn vcs_get(&self, _directory: &str) -> Result<VcsInfo> {
        self.enter(Endpoint::VcsGet).await?;
        Ok(self.data.lock().vcs.clone())
    }

    async fn permission_list(&self, directory: &str) -> Result<Vec<PermissionRequest>> {
        self.enter(Endpoint::PermissionList).await?;
        Ok(self
            .data
            .lock()
            .permissions
            .get(directory)
            .cloned()
            .unwrap_or_default())
    }
}

/// Event source fed by the test through an unbounded channel. Each
/// subscription takes the next scripted connection.
pub struct ScriptedFeed {
    connections: Mutex<Vec<Result<mpsc::UnboundedReceiver<Result<EventEnvelope>>>>>,
    subscribes: Mutex<usize>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            subscribes: Mutex::new(0),
        }
    }

    /// Queues a connection and returns the sender that drives it.
    pub fn connect(&self) -> mpsc::UnboundedSender<Result<EventEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().push(Ok(rx));
        tx
    }

    pub fn refuse(&self) {
        self.connections
            .lock()
            .push(Err(SyncError::Transport("connection refused".to_string())));
    }

    pub fn subscribes(&self) -> usize {
        *self.subscribes.lock()
    }
}

#[async_trait]
impl EventSource for ScriptedFeed {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<EventEnvelope>>> {
        *self.subscribes.lock() += 1;
        let next = {
            let mut connections = self.connections.lock();
            (!connections.is_empty()).then(|| connections.remove(0))
        };
        match next {
            Some(Ok(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Err(err)) => Err(err),
            None => Err(SyncError::Transport("no scripted connection".to_string())),
        }
    }
}

/// Collects every toast shown.
#[derive(Default)]
pub struct CapturingSink {
    toasts: Mutex<Vec<Toast>>,
}

impl CapturingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().clone()
    }
}

impl NotificationSink for CapturingSink {
    fn show(&self, toast: Toast) {
        self.toasts.lock().push(toast);
    }
}
