//! Applies feed events to the global and directory stores.

use std::sync::Arc;

use tokio::task::JoinHandle;

use tether_types::Session;
use tether_wire::{EventEnvelope, SyncEvent};

use crate::directory::{reconcile_in, remove_in, replace, upsert_in, DirectoryState, DirectoryStore};
use crate::notify::Toast;
use crate::reconcile;
use crate::registry::DirectoryRegistry;

pub const RESTART_APP_SERVER_ACTION: &str = "app-server.restart";

/// What a dispatch did.
#[derive(Debug)]
pub enum Dispatch {
    /// A store changed.
    Changed,
    /// The event was handled but left every store as it was.
    Unchanged,
    /// Unknown type or a directory event with an empty scope.
    Ignored,
    /// Follow-up work was started in the background.
    Spawned(Option<JoinHandle<()>>),
}

impl Dispatch {
    fn from_changed(changed: bool) -> Self {
        if changed {
            Dispatch::Changed
        } else {
            Dispatch::Unchanged
        }
    }
}

#[derive(Clone)]
pub struct EventRouter {
    registry: DirectoryRegistry,
}

impl EventRouter {
    pub fn new(registry: DirectoryRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DirectoryRegistry {
        &self.registry
    }

    pub fn dispatch(&self, envelope: &EventEnvelope) -> Dispatch {
        let event = envelope.decode();
        tracing::debug!(scope = %envelope.scope, event = event.name(), "dispatching event");

        if envelope.is_global() {
            return self.dispatch_global(event);
        }
        if envelope.scope.trim().is_empty() {
            tracing::debug!(event = event.name(), "dropping directory event without scope");
            return Dispatch::Ignored;
        }
        if matches!(event, SyncEvent::Unknown { .. }) {
            return Dispatch::Ignored;
        }

        let (store, created) = self.registry.open(&envelope.scope);
        if created && matches!(event, SyncEvent::InstanceDisposed) {
            // the new store's first bootstrap is already running
            return Dispatch::Unchanged;
        }
        self.dispatch_directory(&store, event)
    }

    fn dispatch_global(&self, event: SyncEvent) -> Dispatch {
        let global = self.registry.global();
        match event {
            SyncEvent::GlobalDisposed => {
                let global = global.clone();
                let handle = tokio::runtime::Handle::try_current().ok().map(|rt| {
                    rt.spawn(async move {
                        let _ = global.bootstrap().await;
                    })
                });
                Dispatch::Spawned(handle)
            }
            SyncEvent::ProjectUpdated(project) => {
                Dispatch::from_changed(global.upsert_project(project))
            }
            other => {
                tracing::debug!(event = other.name(), "ignoring event in global scope");
                Dispatch::Ignored
            }
        }
    }

    fn dispatch_directory(&self, store: &Arc<DirectoryStore>, event: SyncEvent) -> Dispatch {
        match event {
            SyncEvent::InstanceDisposed => {
                Dispatch::Spawned(self.registry.spawn_rebootstrap(store.clone()))
            }
            SyncEvent::LspUpdated => Dispatch::Spawned(self.registry.spawn_refresh_lsp(store.clone())),
            SyncEvent::AppServerExited { code, reason } => {
                let mut description = match code {
                    Some(code) => format!("The app server exited with code {code}."),
                    None => "The app server exited.".to_string(),
                };
                if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
                    description.push(' ');
                    description.push_str(&reason);
                }
                self.registry.sink().show(
                    Toast::error("App server stopped", description)
                        .persistent()
                        .with_action("Restart", RESTART_APP_SERVER_ACTION),
                );
                Dispatch::Unchanged
            }
            SyncEvent::GlobalDisposed | SyncEvent::ProjectUpdated(_) | SyncEvent::Unknown { .. } => {
                Dispatch::Ignored
            }
            event => {
                let directory = store.directory().to_string();
                Dispatch::from_changed(store.batch(|state| apply(state, &directory, event)))
            }
        }
    }
}

/// Pure store mutation for events that only touch directory state.
fn apply(state: &mut DirectoryState, directory: &str, event: SyncEvent) -> bool {
    match event {
        SyncEvent::SessionUpdated(session) => apply_session(state, directory, session),
        SyncEvent::SessionDiff { session_id, diff } => {
            reconcile_in(
                &mut state.session_diff,
                &session_id,
                reconcile::sorted_unique(diff),
            )
        }
        SyncEvent::TodoUpdated { session_id, todos } => {
            reconcile_in(&mut state.todo, &session_id, todos)
        }
        SyncEvent::SessionStatus { session_id, status } => {
            if state.session_status.get(&session_id) == Some(&status) {
                return false;
            }
            state.session_status.insert(session_id, status);
            true
        }
        SyncEvent::MessageUpdated(message) => {
            let session_id = message.session_id.clone();
            upsert_in(&mut state.message, &session_id, message)
        }
        SyncEvent::MessageRemoved {
            session_id,
            message_id,
        } => {
            let removed = remove_in(&mut state.message, &session_id, &message_id);
            let parts = state.part.remove(&message_id).is_some();
            removed || parts
        }
        SyncEvent::PartUpdated(part) => {
            let message_id = part.message_id.clone();
            upsert_in(&mut state.part, &message_id, part)
        }
        SyncEvent::PartRemoved {
            message_id,
            part_id,
            ..
        } => remove_in(&mut state.part, &message_id, &part_id),
        SyncEvent::VcsBranchUpdated { branch } => {
            replace(&mut state.vcs, Some(tether_types::VcsInfo { branch }))
        }
        SyncEvent::PermissionAsked(request) => {
            let session_id = request.session_id.clone();
            upsert_in(&mut state.permission, &session_id, request)
        }
        SyncEvent::PermissionReplied {
            session_id,
            request_id,
        } => remove_in(&mut state.permission, &session_id, &request_id),
        SyncEvent::AskUserAsked(request) => {
            let session_id = request.session_id.clone();
            upsert_in(&mut state.askuser, &session_id, request)
        }
        SyncEvent::AskUserReplied {
            session_id,
            request_id,
        } => remove_in(&mut state.askuser, &session_id, &request_id),
        SyncEvent::PlanModeReview(request) => {
            let session_id = request.session_id.clone();
            upsert_in(&mut state.planmode, &session_id, request)
        }
        SyncEvent::PlanModeResponded { request_id } => state
            .planmode
            .values_mut()
            .any(|requests| reconcile::remove(requests, &request_id).is_some()),
        SyncEvent::GlobalDisposed
        | SyncEvent::ProjectUpdated(_)
        | SyncEvent::InstanceDisposed
        | SyncEvent::LspUpdated
        | SyncEvent::AppServerExited { .. }
        | SyncEvent::Unknown { .. } => false,
    }
}

/// Archived sessions leave the list without a tombstone; a later update for
/// the same id inserts it again.
fn apply_session(state: &mut DirectoryState, directory: &str, mut session: Session) -> bool {
    if session.id.trim().is_empty() {
        return false;
    }
    if session.is_archived() {
        return reconcile::remove(&mut state.session, &session.id).is_some();
    }
    if session.directory().is_none() && !directory.trim().is_empty() {
        session.directory = Some(directory.to_string());
    }
    reconcile::upsert(&mut state.session, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tether_observability::ProcessKind;

    use crate::change_bus::ChangeBus;
    use crate::directory::DirectoryStatus;
    use crate::global::GlobalStore;
    use crate::registry::RegistryOptions;
    use crate::test_support::{fast_retry, CapturingSink, Endpoint, FakeServer};

    struct Harness {
        server: Arc<FakeServer>,
        sink: Arc<CapturingSink>,
        router: EventRouter,
    }

    fn harness() -> Harness {
        let server = Arc::new(FakeServer::new());
        let sink = CapturingSink::new();
        let bus = ChangeBus::new();
        let global = GlobalStore::new(server.clone(), fast_retry(), bus.clone(), ProcessKind::Embedded);
        let registry = DirectoryRegistry::new(
            server.clone(),
            global,
            sink.clone(),
            bus,
            RegistryOptions {
                retry: fast_retry(),
                ..RegistryOptions::default()
            },
        );
        Harness {
            server,
            sink,
            router: EventRouter::new(registry),
        }
    }

    fn event(scope: &str, event_type: &str, properties: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(scope, event_type, properties)
    }

    async fn ready(h: &Harness, directory: &str) -> Arc<DirectoryStore> {
        let store = h.router.registry().child(directory);
        tokio::time::timeout(Duration::from_secs(2), store.wait_for(DirectoryStatus::Complete))
            .await
            .expect("bootstrap completes");
        store
    }

    fn session_event(id: &str, archived: Option<u64>) -> serde_json::Value {
        let mut time = json!({"created": 1, "updated": 2});
        if let Some(archived) = archived {
            time["archived"] = json!(archived);
        }
        json!({"info": {"id": id, "title": id, "time": time}})
    }

    #[tokio::test]
    async fn archived_session_is_removed_and_repeat_is_a_no_op() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;

        h.router.dispatch(&event("/srv/app", "session.updated", session_event("ses_1", None)));
        h.router.dispatch(&event("/srv/app", "session.updated", session_event("ses_2", None)));
        assert_eq!(store.read(|s| s.session.len()), 2);
        assert_eq!(
            store.session("ses_1").and_then(|s| s.directory),
            Some("/srv/app".to_string())
        );

        let archive = event("/srv/app", "session.updated", session_event("ses_1", Some(9)));
        assert!(matches!(h.router.dispatch(&archive), Dispatch::Changed));
        let revision = store.revision();
        assert!(matches!(h.router.dispatch(&archive), Dispatch::Unchanged));
        assert_eq!(store.revision(), revision);

        let ids: Vec<String> = store.read(|s| s.session.iter().map(|s| s.id.clone()).collect());
        assert_eq!(ids, vec!["ses_2"]);
    }

    #[tokio::test]
    async fn events_only_touch_their_own_directory() {
        let h = harness();
        let a = ready(&h, "/srv/a").await;
        let b = ready(&h, "/srv/b").await;
        let b_revision = b.revision();

        h.router.dispatch(&event("/srv/a", "session.updated", session_event("ses_1", None)));
        h.router.dispatch(&event(
            "/srv/a",
            "message.updated",
            json!({"info": {"id": "msg_1", "sessionID": "ses_1", "role": "user", "time": {"created": 1}}}),
        ));

        assert_eq!(a.read(|s| s.session.len()), 1);
        assert_eq!(a.read(|s| s.message["ses_1"].len()), 1);
        assert!(b.read(|s| s.session.is_empty() && s.message.is_empty()));
        assert_eq!(b.revision(), b_revision);
    }

    #[tokio::test]
    async fn unknown_permission_reply_is_a_no_op() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;

        h.router.dispatch(&event(
            "/srv/app",
            "permission.asked",
            json!({"id": "per_1", "sessionID": "ses_1", "permission": "bash"}),
        ));
        let before = store.read(|s| s.permission["ses_1"].clone());

        let outcome = h.router.dispatch(&event(
            "/srv/app",
            "permission.replied",
            json!({"sessionID": "ses_1", "requestID": "per_404"}),
        ));
        assert!(matches!(outcome, Dispatch::Unchanged));
        assert_eq!(store.read(|s| s.permission["ses_1"].clone()), before);

        h.router.dispatch(&event(
            "/srv/app",
            "permission.replied",
            json!({"sessionID": "ses_1", "requestID": "per_1"}),
        ));
        assert!(store.read(|s| s.permission["ses_1"].is_empty()));
    }

    #[tokio::test]
    async fn planmode_response_is_found_by_scanning() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;
        for (id, session) in [("pln_1", "ses_1"), ("pln_2", "ses_2")] {
            h.router.dispatch(&event(
                "/srv/app",
                "planmode.review",
                json!({"id": id, "sessionID": session, "plan": "do it"}),
            ));
        }

        let outcome =
            h.router.dispatch(&event("/srv/app", "planmode.responded", json!({"requestID": "pln_2"})));
        assert!(matches!(outcome, Dispatch::Changed));
        store.read(|s| {
            assert_eq!(s.planmode["ses_1"].len(), 1);
            assert!(s.planmode["ses_2"].is_empty());
        });
    }

    #[tokio::test]
    async fn parts_and_messages_stay_sorted() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;
        for id in ["prt_3", "prt_1", "prt_2", "prt_1"] {
            h.router.dispatch(&event(
                "/srv/app",
                "message.part.updated",
                json!({"part": {"id": id, "sessionID": "ses_1", "messageID": "msg_1", "type": "text", "text": id}}),
            ));
        }
        let ids: Vec<String> = store.read(|s| s.part["msg_1"].iter().map(|p| p.id.clone()).collect());
        assert_eq!(ids, vec!["prt_1", "prt_2", "prt_3"]);

        h.router.dispatch(&event(
            "/srv/app",
            "message.part.removed",
            json!({"sessionID": "ses_1", "messageID": "msg_1", "partID": "prt_2"}),
        ));
        assert_eq!(store.read(|s| s.part["msg_1"].len()), 2);
    }

    #[tokio::test]
    async fn diff_todo_status_and_vcs_replace_their_slots() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;

        h.router.dispatch(&event(
            "/srv/app",
            "session.diff",
            json!({"sessionID": "ses_1", "diff": [{"file": "b.rs", "additions": 1}, {"file": "a.rs", "deletions": 2}]}),
        ));
        h.router.dispatch(&event(
            "/srv/app",
            "todo.updated",
            json!({"sessionID": "ses_1", "todos": [{"id": "2", "content": "second", "status": "pending"}, {"id": "1", "content": "first", "status": "completed"}]}),
        ));
        h.router.dispatch(&event(
            "/srv/app",
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "busy"}}),
        ));
        let same_status = h.router.dispatch(&event(
            "/srv/app",
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "busy"}}),
        ));
        assert!(matches!(same_status, Dispatch::Unchanged));
        h.router.dispatch(&event("/srv/app", "vcs.branch.updated", json!({"branch": "feature"})));

        store.read(|s| {
            let files: Vec<&str> = s.session_diff["ses_1"].iter().map(|d| d.file.as_str()).collect();
            assert_eq!(files, vec!["a.rs", "b.rs"]);
            let todos: Vec<&str> = s.todo["ses_1"].iter().map(|t| t.id.as_str()).collect();
            assert_eq!(todos, vec!["2", "1"]);
            assert_eq!(s.session_status["ses_1"], tether_types::SessionStatus::Busy);
            assert_eq!(s.vcs.as_ref().and_then(|v| v.branch.as_deref()), Some("feature"));
        });
    }

    #[tokio::test]
    async fn unknown_events_are_ignored() {
        let h = harness();
        let outcome = h.router.dispatch(&event("/srv/app", "file.watcher.updated", json!({})));
        assert!(matches!(outcome, Dispatch::Ignored));
        assert!(h.router.registry().get("/srv/app").is_none());
    }

    #[tokio::test]
    async fn app_server_exit_shows_persistent_restart_toast() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;
        let revision = store.revision();

        h.router.dispatch(&event("/srv/app", "codex.app-server.exited", json!({"code": 137})));
        let toasts = h.sink.toasts();
        assert_eq!(toasts.len(), 1);
        assert!(toasts[0].persistent);
        assert_eq!(toasts[0].actions[0].action, RESTART_APP_SERVER_ACTION);
        assert!(toasts[0].description.contains("137"));
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn lsp_update_refetches_snapshot() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;
        h.server.set_lsp(vec![tether_types::LspStatus {
            id: "rust-analyzer".into(),
            name: "rust-analyzer".into(),
            root: "/srv/app".into(),
            status: "connected".into(),
        }]);

        match h.router.dispatch(&event("/srv/app", "lsp.updated", json!({}))) {
            Dispatch::Spawned(Some(handle)) => handle.await.expect("refresh"),
            other => panic!("unexpected dispatch: {other:?}"),
        }
        assert_eq!(store.read(|s| s.lsp.as_ref().map(Vec::len)), Some(1));
        assert_eq!(h.server.calls(Endpoint::LspStatus), 2);
    }

    #[tokio::test]
    async fn instance_disposal_reruns_bootstrap() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;

        match h.router.dispatch(&event("/srv/app", "server.instance.disposed", json!({}))) {
            Dispatch::Spawned(Some(handle)) => handle.await.expect("rebootstrap"),
            other => panic!("unexpected dispatch: {other:?}"),
        }
        assert_eq!(store.status(), DirectoryStatus::Complete);
        assert_eq!(h.server.calls(Endpoint::ProjectCurrent), 2);
    }

    #[tokio::test]
    async fn disposal_of_unseen_directory_bootstraps_once() {
        let h = harness();
        h.server.delay(Endpoint::ProjectCurrent, Duration::from_millis(20));

        let outcome = h.router.dispatch(&event("/srv/new", "server.instance.disposed", json!({})));
        assert!(matches!(outcome, Dispatch::Unchanged));
        let store = ready(&h, "/srv/new").await;

        assert_eq!(store.status(), DirectoryStatus::Complete);
        assert_eq!(h.server.calls(Endpoint::ProjectCurrent), 1);
    }

    #[tokio::test]
    async fn askuser_requests_are_tracked_until_replied() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;

        for id in ["ask_2", "ask_1"] {
            let outcome = h.router.dispatch(&event(
                "/srv/app",
                "askuser.asked",
                json!({"id": id, "sessionID": "ses_1", "questions": [{"question": "which branch?"}]}),
            ));
            assert!(matches!(outcome, Dispatch::Changed));
        }
        let ids: Vec<String> =
            store.read(|s| s.askuser["ses_1"].iter().map(|r| r.id.clone()).collect());
        assert_eq!(ids, vec!["ask_1", "ask_2"]);

        let revision = store.revision();
        let outcome = h.router.dispatch(&event(
            "/srv/app",
            "askuser.replied",
            json!({"sessionID": "ses_1", "requestID": "ask_404"}),
        ));
        assert!(matches!(outcome, Dispatch::Unchanged));
        assert_eq!(store.revision(), revision);

        let outcome = h.router.dispatch(&event(
            "/srv/app",
            "askuser.replied",
            json!({"sessionID": "ses_1", "requestID": "ask_1"}),
        ));
        assert!(matches!(outcome, Dispatch::Changed));
        let ids: Vec<String> =
            store.read(|s| s.askuser["ses_1"].iter().map(|r| r.id.clone()).collect());
        assert_eq!(ids, vec!["ask_2"]);
    }

    #[tokio::test]
    async fn message_removal_drops_its_parts() {
        let h = harness();
        let store = ready(&h, "/srv/app").await;
        for id in ["msg_1", "msg_2"] {
            h.router.dispatch(&event(
                "/srv/app",
                "message.updated",
                json!({"info": {"id": id, "sessionID": "ses_1", "role": "assistant"}}),
            ));
            h.router.dispatch(&event(
                "/srv/app",
                "message.part.updated",
                json!({"part": {"id": "prt_1", "sessionID": "ses_1", "messageID": id, "type": "text", "text": "hi"}}),
            ));
        }

        let outcome = h.router.dispatch(&event(
            "/srv/app",
            "message.removed",
            json!({"sessionID": "ses_1", "messageID": "msg_1"}),
        ));
        assert!(matches!(outcome, Dispatch::Changed));
        store.read(|s| {
            let ids: Vec<&str> = s.message["ses_1"].iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["msg_2"]);
            assert!(!s.part.contains_key("msg_1"));
            assert_eq!(s.part["msg_2"].len(), 1);
        });

        let repeat = h.router.dispatch(&event(
            "/srv/app",
            "message.removed",
            json!({"sessionID": "ses_1", "messageID": "msg_1"}),
        ));
        assert!(matches!(repeat, Dispatch::Unchanged));
    }

    #[tokio::test]
    async fn global_project_update_upserts() {
        let h = harness();
        let outcome = h.router.dispatch(&EventEnvelope::global(
            "project.updated",
            json!({"id": "prj_1", "worktree": "/srv/one"}),
        ));
        assert!(matches!(outcome, Dispatch::Changed));
        assert_eq!(h.router.registry().global().read(|s| s.projects.len()), 1);
    }

    #[tokio::test]
    async fn global_disposal_reruns_global_bootstrap() {
        let h = harness();
        match h.router.dispatch(&EventEnvelope::global("global.disposed", json!({}))) {
            Dispatch::Spawned(Some(handle)) => handle.await.expect("bootstrap"),
            other => panic!("unexpected dispatch: {other:?}"),
        }
        assert!(h.router.registry().global().is_ready());
        assert_eq!(h.server.calls(Endpoint::Health), 1);
    }
}
