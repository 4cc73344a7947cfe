use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::SyncEvent;

pub const GLOBAL_SCOPE: &str = "global";

/// One multiplexed feed entry: which store it targets and what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub scope: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// Shape used by the server's global stream: `{directory, payload: {type, properties}}`.
#[derive(Debug, Deserialize)]
struct DirectoryPayload {
    #[serde(default)]
    directory: Option<String>,
    payload: RawEvent,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    properties: Value,
}

impl EventEnvelope {
    pub fn new(scope: impl Into<String>, event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            scope: scope.into(),
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn global(event_type: impl Into<String>, properties: Value) -> Self {
        Self::new(GLOBAL_SCOPE, event_type, properties)
    }

    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }

    pub fn decode(&self) -> SyncEvent {
        SyncEvent::decode(&self.event_type, &self.properties)
    }

    /// Accepts either the flat `{scope, type, properties}` shape or the
    /// server's `{directory, payload}` shape. A missing directory means the
    /// event is global.
    pub fn from_value(value: Value) -> Option<Self> {
        if value.get("payload").is_some() {
            let wrapped: DirectoryPayload = serde_json::from_value(value).ok()?;
            let scope = wrapped
                .directory
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| GLOBAL_SCOPE.to_string());
            return Some(Self {
                scope,
                event_type: wrapped.payload.event_type,
                properties: wrapped.payload.properties,
            });
        }
        if value.get("scope").is_none() && value.get("directory").is_some() {
            let mut value = value;
            if let Some(obj) = value.as_object_mut() {
                if let Some(directory) = obj.remove("directory") {
                    obj.insert("scope".to_string(), directory);
                }
            }
            return serde_json::from_value(value).ok();
        }
        serde_json::from_value(value).ok()
    }
}
