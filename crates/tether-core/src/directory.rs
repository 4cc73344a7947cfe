//! Per-directory state container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use tether_types::{
    Agent, AskUserRequest, Command, FileDiff, LspStatus, McpStatus, Message, Part, PathInfo,
    PermissionRequest, PlanReviewRequest, Project, ProviderCatalog, Session, SessionStatus, Todo,
    VcsInfo,
};

use crate::change_bus::{ChangeBus, StoreChange};
use crate::reconcile::{self, Keyed};

/// Bootstrap progress of one directory. Ordered: `Loading < Partial < Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryStatus {
    Loading,
    Partial,
    Complete,
}

impl DirectoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectoryStatus::Loading => "loading",
            DirectoryStatus::Partial => "partial",
            DirectoryStatus::Complete => "complete",
        }
    }
}

/// Everything known about one working directory.
///
/// Keyed vectors are sorted by id with at most one entry per id. Maps of
/// request lists keep empty vectors for sessions known to have none.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryState {
    pub status: DirectoryStatus,
    /// Project resolved for this directory by the blocking bootstrap wave.
    pub project: Option<Project>,
    pub provider: ProviderCatalog,
    pub agent: Vec<Agent>,
    pub config: Value,
    pub path: Option<PathInfo>,
    pub command: Vec<Command>,
    pub session: Vec<Session>,
    pub session_status: HashMap<String, SessionStatus>,
    pub session_diff: HashMap<String, Vec<FileDiff>>,
    pub todo: HashMap<String, Vec<Todo>>,
    pub permission: HashMap<String, Vec<PermissionRequest>>,
    pub askuser: HashMap<String, Vec<AskUserRequest>>,
    pub planmode: HashMap<String, Vec<PlanReviewRequest>>,
    pub message: HashMap<String, Vec<Message>>,
    pub part: HashMap<String, Vec<Part>>,
    pub mcp: Option<HashMap<String, McpStatus>>,
    pub lsp: Option<Vec<LspStatus>>,
    pub vcs: Option<VcsInfo>,
    /// Session pagination window.
    pub limit: usize,
    pub has_more: bool,
}

impl DirectoryState {
    pub fn new(limit: usize) -> Self {
        Self {
            status: DirectoryStatus::Loading,
            project: None,
            provider: ProviderCatalog::default(),
            agent: Vec::new(),
            config: Value::Null,
            path: None,
            command: Vec::new(),
            session: Vec::new(),
            session_status: HashMap::new(),
            session_diff: HashMap::new(),
            todo: HashMap::new(),
            permission: HashMap::new(),
            askuser: HashMap::new(),
            planmode: HashMap::new(),
            message: HashMap::new(),
            part: HashMap::new(),
            mcp: None,
            lsp: None,
            vcs: None,
            limit,
            has_more: false,
        }
    }
}

/// Upserts into the sorted vector under `key`, creating it if needed.
pub(crate) fn upsert_in<T: Keyed + PartialEq>(
    map: &mut HashMap<String, Vec<T>>,
    key: &str,
    item: T,
) -> bool {
    reconcile::upsert(map.entry(key.to_string()).or_default(), item)
}

/// Removes `id` from the vector under `key`. Missing keys and ids are no-ops;
/// an emptied vector stays in the map.
pub(crate) fn remove_in<T: Keyed>(map: &mut HashMap<String, Vec<T>>, key: &str, id: &str) -> bool {
    map.get_mut(key)
        .and_then(|items| reconcile::remove(items, id))
        .is_some()
}

/// Reconciles the vector under `key` against `next`.
pub(crate) fn reconcile_in<T: Keyed + PartialEq>(
    map: &mut HashMap<String, Vec<T>>,
    key: &str,
    next: Vec<T>,
) -> bool {
    match map.get_mut(key) {
        Some(items) => reconcile::reconcile(items, next),
        None => {
            map.insert(key.to_string(), next);
            true
        }
    }
}

/// Replaces a single value, reporting whether it differed.
pub(crate) fn replace<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

pub struct DirectoryStore {
    directory: String,
    key: String,
    state: RwLock<DirectoryState>,
    status_tx: watch::Sender<DirectoryStatus>,
    revision: AtomicU64,
    bus: ChangeBus,
}

impl DirectoryStore {
    pub fn new(directory: &str, key: String, limit: usize, bus: ChangeBus) -> Self {
        let (status_tx, _) = watch::channel(DirectoryStatus::Loading);
        Self {
            directory: directory.to_string(),
            key,
            state: RwLock::new(DirectoryState::new(limit)),
            status_tx,
            revision: AtomicU64::new(0),
            bus,
        }
    }

    /// The directory as first requested, used when talking to the server.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Normalized registry key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn read<R>(&self, f: impl FnOnce(&DirectoryState) -> R) -> R {
        f(&*self.state.read())
    }

    pub fn snapshot(&self) -> DirectoryState {
        self.state.read().clone()
    }

    /// Applies several writes as one update. `f` reports whether it changed
    /// anything; only then is the revision bumped and a single change
    /// published.
    pub fn batch(&self, f: impl FnOnce(&mut DirectoryState) -> bool) -> bool {
        let (changed, status) = {
            let mut state = self.state.write();
            let before = state.status;
            let changed = f(&mut *state);
            (changed, (state.status != before).then_some(state.status))
        };

        if let Some(status) = status {
            self.status_tx.send_replace(status);
        }
        if changed || status.is_some() {
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            self.bus.publish(StoreChange {
                scope: self.key.clone(),
                revision,
            });
            return true;
        }
        false
    }

    pub fn status(&self) -> DirectoryStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: DirectoryStatus) -> bool {
        self.batch(|state| replace(&mut state.status, status))
    }

    pub fn watch_status(&self) -> watch::Receiver<DirectoryStatus> {
        self.status_tx.subscribe()
    }

    /// Resolves once the status has reached `target`.
    pub async fn wait_for(&self, target: DirectoryStatus) -> DirectoryStatus {
        let mut rx = self.status_tx.subscribe();
        let reached = match rx.wait_for(|status| *status >= target).await {
            Ok(status) => *status,
            // the sender lives as long as `self`
            Err(_) => self.status(),
        };
        reached
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.read(|state| reconcile::get(&state.session, session_id).cloned())
    }
}
