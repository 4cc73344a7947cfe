//! On-demand session detail for one directory.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent};
use tether_types::{
    id, now_ms, Message, MessageRole, MessageTime, MessageWithParts, Part, Session, SessionPatch,
};

use crate::directory::{reconcile_in, replace, upsert_in, DirectoryStatus, DirectoryStore};
use crate::error::Result;
use crate::notify::Toast;
use crate::reconcile;
use crate::registry::DirectoryRegistry;

/// One part of a message the user is about to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PartDraft {
    pub kind: String,
    pub body: Map<String, Value>,
}

impl PartDraft {
    pub fn text(text: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("text".to_string(), Value::String(text.into()));
        Self {
            kind: "text".to_string(),
            body,
        }
    }
}

/// A user message shown before the server has confirmed it. Pass the
/// returned ids along with the prompt so the server's own
/// `message.updated` lands on the same entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimisticMessage {
    pub session_id: String,
    /// Generated when absent.
    pub message_id: Option<String>,
    pub agent: Option<String>,
    pub model: Option<Value>,
    pub parts: Vec<PartDraft>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Another session became active while the fetch was in flight.
    Stale,
}

pub struct SessionSync {
    registry: DirectoryRegistry,
    store: Arc<DirectoryStore>,
    active: RwLock<Option<String>>,
}

impl SessionSync {
    pub fn new(registry: DirectoryRegistry, directory: &str) -> Self {
        let store = registry.child(directory);
        Self {
            registry,
            store,
            active: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    pub fn active(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn set_active(&self, session_id: Option<&str>) {
        *self.active.write() = session_id.map(str::to_string);
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.active.read().as_deref() == Some(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.store.session(session_id)
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.store
            .read(|state| state.message.get(session_id).cloned().unwrap_or_default())
    }

    pub fn parts(&self, message_id: &str) -> Vec<Part> {
        self.store
            .read(|state| state.part.get(message_id).cloned().unwrap_or_default())
    }

    pub fn has_more(&self) -> bool {
        self.store.read(|state| state.has_more)
    }

    /// Inserts a user message and its parts locally, in one update.
    pub fn add_optimistic_message(&self, input: OptimisticMessage) -> MessageWithParts {
        let message_id = input
            .message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| id::ascending("msg"));

        let info = Message {
            id: message_id.clone(),
            session_id: input.session_id.clone(),
            role: MessageRole::User,
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            agent: input.agent,
            model: input.model,
            parent_id: None,
            extra: Map::new(),
        };
        let parts: Vec<Part> = input
            .parts
            .into_iter()
            .map(|draft| Part {
                id: id::ascending("prt"),
                session_id: input.session_id.clone(),
                message_id: message_id.clone(),
                kind: draft.kind,
                body: draft.body,
            })
            .collect();

        self.store.batch(|state| {
            let mut changed = upsert_in(
                &mut state.message,
                &input.session_id,
                info.clone(),
            );
            let slot = state.part.entry(message_id.clone()).or_default();
            for part in &parts {
                changed |= reconcile::upsert(slot, part.clone());
            }
            changed
        });

        MessageWithParts { info, parts }
    }

    /// Fetches session detail, history, todos and diff in parallel and
    /// applies them together. Results are dropped if another session became
    /// active meanwhile; a failure is still returned then, but without a
    /// toast. `on_missing` runs when the server no longer knows the session
    /// and it is still active.
    pub async fn sync<F>(&self, session_id: &str, on_missing: F) -> Result<SyncOutcome>
    where
        F: FnOnce(),
    {
        self.set_active(Some(session_id));
        let directory = self.store.directory();
        let api = self.registry.api().as_ref();

        let fetched = tokio::try_join!(
            api.session_get(directory, session_id),
            api.session_messages(directory, session_id),
            api.session_todo(directory, session_id),
            api.session_diff(directory, session_id),
        );

        let (session, history, todos, diff) = match fetched {
            Ok(fetched) if self.is_active(session_id) => fetched,
            Ok(_) => {
                tracing::debug!(session_id, "discarding stale session sync");
                return Ok(SyncOutcome::Stale);
            }
            // the caller moved on; report the failure without toasting or
            // running `on_missing`
            Err(err) if !self.is_active(session_id) => {
                tracing::debug!(session_id, error = %err, "stale session sync failed");
                return Err(err);
            }
            Err(err) => {
                let detail = err.to_string();
                self.registry.sink().show(Toast::error(
                    "Failed to load session",
                    format!("Could not load a session in {}: {}", self.registry.project_name(&self.store), detail),
                ));
                emit_event(
                    Level::WARN,
                    self.registry.options().process,
                    ObservabilityEvent {
                        event: "session.sync.failed",
                        component: "session_sync",
                        directory: Some(directory),
                        session_id: Some(session_id),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                if err.is_not_found() {
                    on_missing();
                }
                return Err(err);
            }
        };

        let mut messages = Vec::with_capacity(history.len());
        let mut parts = Vec::with_capacity(history.len());
        for entry in history {
            parts.push((entry.info.id.clone(), reconcile::sorted_unique(entry.parts)));
            messages.push(entry.info);
        }
        let messages = reconcile::sorted_unique(messages);

        self.store.batch(|state| {
            let mut changed = if session.is_archived() {
                reconcile::remove(&mut state.session, &session.id).is_some()
            } else {
                let mut session = session;
                if session.directory().is_none() {
                    session.directory = Some(directory.to_string());
                }
                reconcile::upsert(&mut state.session, session)
            };
            changed |= reconcile_in(&mut state.message, session_id, messages);
            for (message_id, message_parts) in parts {
                changed |= reconcile_in(&mut state.part, &message_id, message_parts);
            }
            changed |= reconcile_in(&mut state.todo, session_id, todos);
            changed |= reconcile_in(
                &mut state.session_diff,
                session_id,
                reconcile::sorted_unique(diff),
            );
            changed
        });

        Ok(SyncOutcome::Applied)
    }

    /// Widens the pagination window by `count` and reloads a capped list.
    pub async fn fetch(&self, count: usize) -> Result<()> {
        let mut limit = 0;
        self.store.batch(|state| {
            limit = state.limit.saturating_add(count);
            replace(&mut state.limit, limit)
        });
        self.registry.load_sessions(&self.store, Some(limit)).await
    }

    /// Archives remotely first; the session leaves the local list only once
    /// the server accepted the change.
    pub async fn archive(&self, session_id: &str) -> Result<()> {
        let patch = SessionPatch::archive_at(now_ms());
        self.registry
            .api()
            .session_update(self.store.directory(), session_id, &patch)
            .await?;
        self.store
            .batch(|state| reconcile::remove(&mut state.session, session_id).is_some());
        Ok(())
    }

    /// Resolves once the directory has at least its blocking data.
    pub async fn ready(&self) {
        self.store.wait_for(DirectoryStatus::Partial).await;
    }
}
