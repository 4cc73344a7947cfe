use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<u64>,
}

/// A project known to the server. `sandboxes` lists extra directories that
/// may host the project's sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub sandboxes: Vec<String>,
    #[serde(default)]
    pub time: ProjectTime,
}

impl Project {
    pub fn new(id: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worktree: worktree.into(),
            vcs: None,
            name: None,
            sandboxes: Vec::new(),
            time: ProjectTime::default(),
        }
    }
}

/// Well-known paths reported by `GET /path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default)]
    pub directory: String,
}
