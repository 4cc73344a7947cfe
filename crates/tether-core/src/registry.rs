//! Lazily populated directory stores and their bootstrap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::{PermissionRequest, Project};

use crate::api::ServerApi;
use crate::change_bus::ChangeBus;
use crate::directory::{reconcile_in, replace, DirectoryStatus, DirectoryStore};
use crate::error::{Result, SyncError};
use crate::global::GlobalStore;
use crate::notify::{NotificationSink, Toast};
use crate::path::{display_name, normalize};
use crate::reconcile;
use crate::retry::RetryPolicy;
use crate::sessions::SessionListPolicy;

/// Settings shared by every directory store.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub retry: RetryPolicy,
    pub session_limit: usize,
    pub recent_window: Duration,
    pub process: ProcessKind,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            session_limit: 5,
            recent_window: Duration::from_secs(4 * 60 * 60),
            process: ProcessKind::Embedded,
        }
    }
}

struct RegistryInner {
    api: Arc<dyn ServerApi>,
    global: GlobalStore,
    sink: Arc<dyn NotificationSink>,
    bus: ChangeBus,
    options: RegistryOptions,
    stores: Mutex<HashMap<String, Arc<DirectoryStore>>>,
    /// At most one bootstrap pass in flight per directory key.
    bootstraps: Mutex<HashMap<String, AbortHandle>>,
}

/// Owns one [`DirectoryStore`] per normalized directory.
#[derive(Clone)]
pub struct DirectoryRegistry {
    inner: Arc<RegistryInner>,
}

impl DirectoryRegistry {
    pub fn new(
        api: Arc<dyn ServerApi>,
        global: GlobalStore,
        sink: Arc<dyn NotificationSink>,
        bus: ChangeBus,
        options: RegistryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                api,
                global,
                sink,
                bus,
                options,
                stores: Mutex::new(HashMap::new()),
                bootstraps: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn api(&self) -> &Arc<dyn ServerApi> {
        &self.inner.api
    }

    pub fn global(&self) -> &GlobalStore {
        &self.inner.global
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.inner.sink
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Returns the store for `directory`, allocating it and starting its
    /// bootstrap on first use. Concurrent callers share one store and one
    /// bootstrap.
    pub fn child(&self, directory: &str) -> Arc<DirectoryStore> {
        self.open(directory).0
    }

    /// Like [`child`](Self::child), also reporting whether this call
    /// allocated the store (and so already started its bootstrap).
    pub fn open(&self, directory: &str) -> (Arc<DirectoryStore>, bool) {
        let key = normalize(directory);
        let (store, created) = {
            let mut stores = self.inner.stores.lock();
            match stores.get(&key) {
                Some(store) => (store.clone(), false),
                None => {
                    let store = Arc::new(DirectoryStore::new(
                        directory,
                        key.clone(),
                        self.inner.options.session_limit,
                        self.inner.bus.clone(),
                    ));
                    stores.insert(key, store.clone());
                    (store, true)
                }
            }
        };

        if created {
            tracing::debug!(directory, "allocated directory store");
            self.spawn_bootstrap(store.clone());
        }
        (store, created)
    }

    /// The store for `directory` if one was already allocated.
    pub fn get(&self, directory: &str) -> Option<Arc<DirectoryStore>> {
        self.inner.stores.lock().get(&normalize(directory)).cloned()
    }

    pub fn directories(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.stores.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Starts a bootstrap pass. A pass still in flight for the same
    /// directory is aborted first, so only the newest pass settles the
    /// status.
    pub fn spawn_bootstrap(&self, store: Arc<DirectoryStore>) -> Option<JoinHandle<()>> {
        let registry = self.clone();
        let key = store.key().to_string();

        let mut bootstraps = self.inner.bootstraps.lock();
        if let Some(previous) = bootstraps.remove(&key) {
            if !previous.is_finished() {
                tracing::debug!(directory = %key, "superseding in-flight bootstrap");
                previous.abort();
            }
        }
        let handle = self.spawn(async move {
            let _ = registry.bootstrap_instance(&store).await;
        })?;
        bootstraps.insert(key, handle.abort_handle());
        Some(handle)
    }

    /// Restarts the bootstrap from `Loading`, used when the directory's
    /// server instance was disposed.
    pub fn spawn_rebootstrap(&self, store: Arc<DirectoryStore>) -> Option<JoinHandle<()>> {
        store.set_status(DirectoryStatus::Loading);
        self.spawn_bootstrap(store)
    }

    pub fn spawn_refresh_lsp(&self, store: Arc<DirectoryStore>) -> Option<JoinHandle<()>> {
        let registry = self.clone();
        self.spawn(async move {
            registry.refresh_lsp(&store).await;
        })
    }

    fn spawn<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(task)),
            Err(_) => {
                tracing::warn!("no async runtime available; background sync task not started");
                None
            }
        }
    }

    /// Blocking wave (project, providers, agents, config), then `Partial`,
    /// then the optional wave, then `Complete`. A blocking failure is fatal
    /// for the whole app and leaves the store where it was.
    pub async fn bootstrap_instance(&self, store: &Arc<DirectoryStore>) -> Result<()> {
        let directory = store.directory();
        let api = self.inner.api.as_ref();
        let retry = &self.inner.options.retry;
        self.emit(Level::INFO, "directory.bootstrap.start", store, None);

        let blocking = tokio::try_join!(
            retry.run("project.current", move || api.project_current(directory)),
            retry.run("provider.list", move || api.provider_list(Some(directory))),
            retry.run("app.agents", move || api.app_agents(directory)),
            retry.run("config.get", move || api.config_get(directory)),
        );

        let (project, provider, agents, config) = match blocking {
            Ok(loaded) => loaded,
            Err(err) => {
                let detail = err.to_string();
                self.inner.global.set_error(format!(
                    "Failed to load {}: {}",
                    display_name(directory),
                    detail
                ));
                self.emit(Level::ERROR, "directory.bootstrap.failed", store, Some(&detail));
                return Err(err);
            }
        };

        store.batch(|state| {
            state.project = Some(project);
            state.provider = provider.without_deprecated_models();
            state.agent = agents;
            state.config = config;
            if state.status != DirectoryStatus::Complete {
                state.status = DirectoryStatus::Partial;
            }
            true
        });
        self.emit(Level::INFO, "directory.bootstrap.partial", store, None);

        tokio::join!(
            async {
                match api.path_get(Some(directory)).await {
                    Ok(path) => {
                        store.batch(|state| replace(&mut state.path, Some(path)));
                    }
                    Err(err) => self.optional_failed(store, "path.get", &err),
                }
            },
            async {
                match api.command_list(directory).await {
                    Ok(commands) => {
                        store.batch(|state| replace(&mut state.command, commands));
                    }
                    Err(err) => self.optional_failed(store, "command.list", &err),
                }
            },
            async {
                match api.session_status(directory).await {
                    Ok(statuses) => {
                        store.batch(|state| replace(&mut state.session_status, statuses));
                    }
                    Err(err) => self.optional_failed(store, "session.status", &err),
                }
            },
            async {
                // failures already surfaced as a toast
                let _ = self.load_sessions(store, None).await;
            },
            async {
                match api.mcp_status(directory).await {
                    Ok(mcp) => {
                        store.batch(|state| replace(&mut state.mcp, Some(mcp)));
                    }
                    Err(err) => self.optional_failed(store, "mcp.status", &err),
                }
            },
            async {
                self.refresh_lsp(store).await;
            },
            async {
                match api.vcs_get(directory).await {
                    Ok(vcs) => {
                        store.batch(|state| replace(&mut state.vcs, Some(vcs)));
                    }
                    Err(err) => self.optional_failed(store, "vcs.get", &err),
                }
            },
            async {
                match api.permission_list(directory).await {
                    Ok(list) => {
                        store.batch(|state| apply_permission_snapshot(&mut state.permission, list));
                    }
                    Err(err) => self.optional_failed(store, "permission.list", &err),
                }
            },
        );

        store.set_status(DirectoryStatus::Complete);
        self.emit(Level::INFO, "directory.bootstrap.complete", store, None);
        Ok(())
    }

    /// Fetches the session list and applies the listing policy. `server_limit`
    /// caps the request; `None` asks for everything. On failure a toast names
    /// the project and the current list is kept.
    pub async fn load_sessions(
        &self,
        store: &Arc<DirectoryStore>,
        server_limit: Option<usize>,
    ) -> Result<()> {
        let directory = store.directory();
        let sessions = match self.inner.api.session_list(directory, server_limit).await {
            Ok(sessions) => sessions,
            Err(err) => {
                let name = self.project_name(store);
                let detail = err.to_string();
                self.inner.sink.show(Toast::error(
                    "Failed to load sessions",
                    format!("Could not load sessions for {name}: {detail}"),
                ));
                self.emit(Level::WARN, "directory.sessions.failed", store, Some(&detail));
                return Err(err);
            }
        };

        let (limit, own_project) = store.read(|state| (state.limit, state.project.clone()));
        let project = own_project.map(|own| self.freshest_project(own));
        let global_directory = self.inner.global.default_directory();
        let page = SessionListPolicy {
            directory,
            project: project.as_ref(),
            global_directory: global_directory.as_deref(),
            limit,
            recent_window: self.inner.options.recent_window,
            now_ms: tether_types::now_ms(),
        }
        .apply(sessions);

        store.batch(|state| {
            let sessions = reconcile::reconcile(&mut state.session, page.sessions);
            let more = replace(&mut state.has_more, page.has_more);
            sessions | more
        });
        Ok(())
    }

    pub async fn refresh_lsp(&self, store: &Arc<DirectoryStore>) {
        match self.inner.api.lsp_status(store.directory()).await {
            Ok(lsp) => {
                store.batch(|state| replace(&mut state.lsp, Some(lsp)));
            }
            Err(err) => self.optional_failed(store, "lsp.status", &err),
        }
    }

    /// Sandboxes can change after bootstrap through `project.updated`.
    fn freshest_project(&self, own: Project) -> Project {
        self.inner
            .global
            .read(|state| reconcile::get(&state.projects, &own.id).cloned())
            .unwrap_or(own)
    }

    pub fn project_name(&self, store: &DirectoryStore) -> String {
        store.read(|state| {
            state
                .project
                .as_ref()
                .and_then(|p| {
                    p.name
                        .clone()
                        .filter(|n| !n.trim().is_empty())
                        .or_else(|| (!p.worktree.is_empty()).then(|| display_name(&p.worktree)))
                })
                .unwrap_or_else(|| display_name(store.directory()))
        })
    }

    fn optional_failed(&self, store: &DirectoryStore, label: &str, err: &SyncError) {
        tracing::warn!(directory = store.directory(), label, error = %err, "optional bootstrap request failed");
        self.emit(Level::WARN, "directory.bootstrap.optional_failed", store, Some(label));
    }

    fn emit(&self, level: Level, event: &str, store: &DirectoryStore, detail: Option<&str>) {
        emit_event(
            level,
            self.inner.options.process,
            ObservabilityEvent {
                event,
                component: "directory",
                directory: Some(store.directory()),
                status: Some(store.status().as_str()),
                detail,
                ..Default::default()
            },
        );
    }
}

/// Groups a permission snapshot by session. Sessions that had requests
/// before but none now are kept as known-empty.
fn apply_permission_snapshot(
    permission: &mut HashMap<String, Vec<PermissionRequest>>,
    list: Vec<PermissionRequest>,
) -> bool {
    let mut grouped: HashMap<String, Vec<PermissionRequest>> = HashMap::new();
    for request in list {
        if request.session_id.is_empty() || request.id.is_empty() {
            continue;
        }
        grouped
            .entry(request.session_id.clone())
            .or_default()
            .push(request);
    }

    let stale: Vec<String> = permission
        .keys()
        .filter(|session_id| !grouped.contains_key(*session_id))
        .cloned()
        .collect();

    let mut changed = false;
    for session_id in stale {
        changed |= reconcile_in(permission, &session_id, Vec::new());
    }
    for (session_id, requests) in grouped {
        changed |= reconcile_in(permission, &session_id, reconcile::sorted_unique(requests));
    }
    changed
}
