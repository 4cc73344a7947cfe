use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use tether_types::{
    AskUserRequest, FileDiff, Message, Part, PermissionRequest, PlanReviewRequest, Project,
    Session, SessionStatus, Todo,
};

/// Every event type the sync engine acts on. Anything else decodes to
/// [`SyncEvent::Unknown`] and is ignored by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    GlobalDisposed,
    ProjectUpdated(Project),
    InstanceDisposed,
    SessionUpdated(Session),
    SessionDiff {
        session_id: String,
        diff: Vec<FileDiff>,
    },
    TodoUpdated {
        session_id: String,
        todos: Vec<Todo>,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    MessageUpdated(Message),
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PartUpdated(Part),
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    VcsBranchUpdated {
        branch: Option<String>,
    },
    PermissionAsked(PermissionRequest),
    PermissionReplied {
        session_id: String,
        request_id: String,
    },
    LspUpdated,
    AskUserAsked(AskUserRequest),
    AskUserReplied {
        session_id: String,
        request_id: String,
    },
    PlanModeReview(PlanReviewRequest),
    /// Carries no session id; the request has to be located by scanning.
    PlanModeResponded {
        request_id: String,
    },
    AppServerExited {
        code: Option<i64>,
        reason: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct PartProps {
    part: Part,
}

#[derive(Deserialize)]
struct DiffProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    diff: Vec<FileDiff>,
}

#[derive(Deserialize)]
struct TodoProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    todos: Vec<Todo>,
}

#[derive(Deserialize)]
struct StatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatus,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Deserialize)]
struct BranchProps {
    #[serde(default)]
    branch: Option<String>,
}

#[derive(Deserialize)]
struct ReplyProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
}

#[derive(Deserialize)]
struct RespondedProps {
    #[serde(rename = "requestID")]
    request_id: String,
}

#[derive(Deserialize, Default)]
struct ExitProps {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
}

fn props<T: DeserializeOwned>(properties: &Value) -> serde_json::Result<T> {
    T::deserialize(properties)
}

impl SyncEvent {
    pub fn decode(event_type: &str, properties: &Value) -> SyncEvent {
        let event_type = event_type.trim();
        let decoded = match event_type {
            "global.disposed" => Ok(SyncEvent::GlobalDisposed),
            "project.updated" => props::<Project>(properties).map(SyncEvent::ProjectUpdated),
            "server.instance.disposed" => Ok(SyncEvent::InstanceDisposed),
            "session.updated" => {
                props::<InfoProps<Session>>(properties).map(|p| SyncEvent::SessionUpdated(p.info))
            }
            "session.diff" => props::<DiffProps>(properties).map(|p| SyncEvent::SessionDiff {
                session_id: p.session_id,
                diff: p.diff,
            }),
            "todo.updated" => props::<TodoProps>(properties).map(|p| SyncEvent::TodoUpdated {
                session_id: p.session_id,
                todos: p.todos,
            }),
            "session.status" => props::<StatusProps>(properties).map(|p| SyncEvent::SessionStatus {
                session_id: p.session_id,
                status: p.status,
            }),
            "message.updated" => {
                props::<InfoProps<Message>>(properties).map(|p| SyncEvent::MessageUpdated(p.info))
            }
            "message.removed" => {
                props::<MessageRemovedProps>(properties).map(|p| SyncEvent::MessageRemoved {
                    session_id: p.session_id,
                    message_id: p.message_id,
                })
            }
            "message.part.updated" => {
                props::<PartProps>(properties).map(|p| SyncEvent::PartUpdated(p.part))
            }
            "message.part.removed" => {
                props::<PartRemovedProps>(properties).map(|p| SyncEvent::PartRemoved {
                    session_id: p.session_id,
                    message_id: p.message_id,
                    part_id: p.part_id,
                })
            }
            "vcs.branch.updated" => props::<BranchProps>(properties)
                .map(|p| SyncEvent::VcsBranchUpdated { branch: p.branch }),
            "permission.asked" => {
                props::<PermissionRequest>(properties).map(SyncEvent::PermissionAsked)
            }
            "permission.replied" => {
                props::<ReplyProps>(properties).map(|p| SyncEvent::PermissionReplied {
                    session_id: p.session_id,
                    request_id: p.request_id,
                })
            }
            "lsp.updated" => Ok(SyncEvent::LspUpdated),
            "askuser.asked" => props::<AskUserRequest>(properties).map(SyncEvent::AskUserAsked),
            "askuser.replied" => props::<ReplyProps>(properties).map(|p| SyncEvent::AskUserReplied {
                session_id: p.session_id,
                request_id: p.request_id,
            }),
            "planmode.review" => {
                props::<PlanReviewRequest>(properties).map(SyncEvent::PlanModeReview)
            }
            "planmode.responded" => props::<RespondedProps>(properties)
                .map(|p| SyncEvent::PlanModeResponded {
                    request_id: p.request_id,
                }),
            "codex.app-server.exited" => {
                let p = props::<ExitProps>(properties).unwrap_or_default();
                Ok(SyncEvent::AppServerExited {
                    code: p.code,
                    reason: p.reason,
                })
            }
            other => Ok(SyncEvent::Unknown {
                event_type: other.to_string(),
            }),
        };

        decoded.unwrap_or_else(|err| {
            tracing::warn!(event_type, error = %err, "dropping malformed event payload");
            SyncEvent::Unknown {
                event_type: event_type.to_string(),
            }
        })
    }

    pub fn name(&self) -> &str {
        match self {
            SyncEvent::GlobalDisposed => "global.disposed",
            SyncEvent::ProjectUpdated(_) => "project.updated",
            SyncEvent::InstanceDisposed => "server.instance.disposed",
            SyncEvent::SessionUpdated(_) => "session.updated",
            SyncEvent::SessionDiff { .. } => "session.diff",
            SyncEvent::TodoUpdated { .. } => "todo.updated",
            SyncEvent::SessionStatus { .. } => "session.status",
            SyncEvent::MessageUpdated(_) => "message.updated",
            SyncEvent::MessageRemoved { .. } => "message.removed",
            SyncEvent::PartUpdated(_) => "message.part.updated",
            SyncEvent::PartRemoved { .. } => "message.part.removed",
            SyncEvent::VcsBranchUpdated { .. } => "vcs.branch.updated",
            SyncEvent::PermissionAsked(_) => "permission.asked",
            SyncEvent::PermissionReplied { .. } => "permission.replied",
            SyncEvent::LspUpdated => "lsp.updated",
            SyncEvent::AskUserAsked(_) => "askuser.asked",
            SyncEvent::AskUserReplied { .. } => "askuser.replied",
            SyncEvent::PlanModeReview(_) => "planmode.review",
            SyncEvent::PlanModeResponded { .. } => "planmode.responded",
            SyncEvent::AppServerExited { .. } => "codex.app-server.exited",
            SyncEvent::Unknown { event_type } => event_type,
        }
    }
}
