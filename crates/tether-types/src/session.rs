use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session timestamps as reported by the server (milliseconds since epoch).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
    /// Share, summary and revert blocks the client carries through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: None,
            project_id: None,
            directory: None,
            parent_id: None,
            title: String::new(),
            version: None,
            time: SessionTime::default(),
            extra: Map::new(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.time.archived.is_some()
    }

    /// Most recent activity, falling back to creation time when the server
    /// never reported an update.
    pub fn last_activity_ms(&self) -> u64 {
        if self.time.updated > 0 {
            self.time.updated
        } else {
            self.time.created
        }
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// Partial update accepted by `PATCH /session/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<SessionPatchTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatchTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<u64>,
}

impl SessionPatch {
    pub fn archive_at(timestamp_ms: u64) -> Self {
        Self {
            title: None,
            time: Some(SessionPatchTime {
                archived: Some(timestamp_ms),
            }),
        }
    }
}

/// Run state of a session as pushed by `session.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        attempt: u32,
        #[serde(default)]
        message: String,
        #[serde(default)]
        next: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: String, // "pending" | "in_progress" | "completed" | "cancelled"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Per-file change summary for a session, keyed by `file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}
