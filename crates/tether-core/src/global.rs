//! Process-wide state: home paths, known projects, provider catalog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::{PathInfo, Project, ProviderAuth, ProviderCatalog};

use crate::api::ServerApi;
use crate::change_bus::{ChangeBus, StoreChange};
use crate::directory::replace;
use crate::error::{Result, SyncError};
use crate::reconcile;
use crate::retry::RetryPolicy;

pub const GLOBAL_SCOPE: &str = tether_wire::GLOBAL_SCOPE;

/// Worktrees under these names belong to throwaway test fixtures.
const DISPOSABLE_WORKTREE_MARKERS: &[&str] = &["opencode-test", "tether-test"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalState {
    pub ready: bool,
    pub error: Option<String>,
    pub path: PathInfo,
    pub projects: Vec<Project>,
    pub providers: ProviderCatalog,
    pub provider_auth: ProviderAuth,
}

struct GlobalInner {
    api: Arc<dyn ServerApi>,
    retry: RetryPolicy,
    process: ProcessKind,
    state: RwLock<GlobalState>,
    ready_tx: watch::Sender<bool>,
    revision: AtomicU64,
    bus: ChangeBus,
}

#[derive(Clone)]
pub struct GlobalStore {
    inner: Arc<GlobalInner>,
}

pub fn is_listable_project(project: &Project) -> bool {
    if project.id.trim().is_empty() || project.worktree.trim().is_empty() {
        return false;
    }
    !DISPOSABLE_WORKTREE_MARKERS
        .iter()
        .any(|marker| project.worktree.contains(marker))
}

impl GlobalStore {
    pub fn new(
        api: Arc<dyn ServerApi>,
        retry: RetryPolicy,
        bus: ChangeBus,
        process: ProcessKind,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(GlobalInner {
                api,
                retry,
                process,
                state: RwLock::new(GlobalState::default()),
                ready_tx,
                revision: AtomicU64::new(0),
                bus,
            }),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&GlobalState) -> R) -> R {
        f(&*self.inner.state.read())
    }

    pub fn snapshot(&self) -> GlobalState {
        self.inner.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.read().ready
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.read().error.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn watch_ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    /// Resolves once readiness is true.
    pub async fn wait_ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// The server's default working directory, once known.
    pub fn default_directory(&self) -> Option<String> {
        self.read(|state| {
            let dir = state.path.directory.trim();
            (!dir.is_empty()).then(|| dir.to_string())
        })
    }

    pub fn batch(&self, f: impl FnOnce(&mut GlobalState) -> bool) -> bool {
        let (changed, ready) = {
            let mut state = self.inner.state.write();
            let before = state.ready;
            let changed = f(&mut *state);
            (changed, (state.ready != before).then_some(state.ready))
        };

        if let Some(ready) = ready {
            self.inner.ready_tx.send_replace(ready);
        }
        if changed || ready.is_some() {
            let revision = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.bus.publish(StoreChange {
                scope: GLOBAL_SCOPE.to_string(),
                revision,
            });
            return true;
        }
        false
    }

    /// Records a fatal error. The first error wins; later ones are logged only.
    pub fn set_error(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let set = self.batch(|state| {
            if state.error.is_some() {
                return false;
            }
            state.error = Some(message.clone());
            true
        });
        if set {
            tracing::error!("sync engine fatal error: {}", message);
        } else {
            tracing::debug!("fatal error already recorded, dropping: {}", message);
        }
        set
    }

    /// Inserts or replaces a project pushed by `project.updated`.
    pub fn upsert_project(&self, project: Project) -> bool {
        if !is_listable_project(&project) {
            tracing::debug!(project = %project.id, "ignoring unlistable project update");
            return false;
        }
        self.batch(|state| reconcile::upsert(&mut state.projects, project))
    }

    /// Health check, then path, projects, providers and provider auth in
    /// parallel. Any failure is fatal: readiness stays false and the error
    /// slot is set. Safe to call again; readiness drops while it runs.
    pub async fn bootstrap(&self) -> Result<()> {
        self.batch(|state| replace(&mut state.ready, false));

        let api = self.inner.api.as_ref();
        let unhealthy = match api.health().await {
            Ok(health) if health.healthy => None,
            Ok(_) => Some("server reported unhealthy".to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = unhealthy {
            self.set_error(format!("Could not connect to the server: {reason}"));
            self.emit(Level::ERROR, "global.bootstrap.unhealthy", Some(&reason));
            return Err(SyncError::Unhealthy(reason));
        }

        let retry = &self.inner.retry;
        let loaded = tokio::try_join!(
            retry.run("path.get", move || api.path_get(None)),
            retry.run("project.list", move || api.project_list()),
            retry.run("provider.list", move || api.provider_list(None)),
            retry.run("provider.auth", move || api.provider_auth()),
        );

        let (path, projects, providers, provider_auth) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                let detail = err.to_string();
                self.set_error(format!("Failed to load application state: {detail}"));
                self.emit(Level::ERROR, "global.bootstrap.failed", Some(&detail));
                return Err(err);
            }
        };

        let projects = reconcile::sorted_unique(
            projects.into_iter().filter(is_listable_project).collect(),
        );
        let project_count = projects.len();

        self.batch(|state| {
            state.path = path;
            state.projects = projects;
            state.providers = providers;
            state.provider_auth = provider_auth;
            state.ready = true;
            true
        });

        tracing::info!(projects = project_count, "global bootstrap complete");
        self.emit(Level::INFO, "global.bootstrap.ready", None);
        Ok(())
    }

    fn emit(&self, level: Level, event: &str, detail: Option<&str>) {
        emit_event(
            level,
            self.inner.process,
            ObservabilityEvent {
                event,
                component: "global",
                detail,
                ..Default::default()
            },
        );
    }
}
