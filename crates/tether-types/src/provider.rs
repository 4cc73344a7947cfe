use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelLimit {
    #[serde(default)]
    pub context: u64,
    #[serde(default)]
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// `alpha`, `beta`, `deprecated`, or absent for stable models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<ModelLimit>,
}

impl ModelInfo {
    pub fn is_deprecated(&self) -> bool {
        self.status.as_deref() == Some("deprecated")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub models: BTreeMap<String, ModelInfo>,
}

/// Response of `GET /provider`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default)]
    pub all: Vec<ProviderInfo>,
    #[serde(default)]
    pub connected: Vec<String>,
    /// Provider id -> default model id.
    #[serde(default)]
    pub default: HashMap<String, String>,
}

impl ProviderCatalog {
    pub fn without_deprecated_models(mut self) -> Self {
        for provider in &mut self.all {
            provider.models.retain(|_, model| !model.is_deprecated());
        }
        self
    }

    pub fn is_connected(&self, provider_id: &str) -> bool {
        self.connected.iter().any(|id| id == provider_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAuthMethod {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
}

/// Response of `GET /provider/auth`: provider id -> supported auth methods.
pub type ProviderAuth = HashMap<String, Vec<ProviderAuthMethod>>;
