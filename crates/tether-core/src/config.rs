//! Sync engine configuration.
//!
//! Loaded in priority order: `TETHER_*` environment variables > JSON config
//! file > built-in defaults. The file only needs the keys it overrides; it is
//! deep-merged over the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4096";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub server_url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Initial session pagination window per directory.
    pub session_limit: usize,
    /// Sessions beyond the window stay listed if updated within this span.
    pub recent_window: Duration,
    pub event_buffer: usize,
    pub logs_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            session_limit: 5,
            recent_window: Duration::from_secs(4 * 60 * 60),
            event_buffer: 2048,
            logs_dir: default_logs_dir(),
        }
    }
}

fn default_logs_dir() -> PathBuf {
    let root = dirs::data_local_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"));
    tether_observability::canonical_logs_dir_from_root(&root)
}

/// On-disk shape. Durations are spelled out in their unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileConfig {
    server_url: String,
    #[serde(default)]
    api_token: Option<String>,
    request_timeout_secs: u64,
    retry: FileRetry,
    session_limit: usize,
    recent_window_secs: u64,
    event_buffer: usize,
    logs_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRetry {
    attempts: u32,
    initial_delay_ms: u64,
    factor: u32,
    max_delay_ms: u64,
}

impl From<&SyncConfig> for FileConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            api_token: config.api_token.clone(),
            request_timeout_secs: config.request_timeout.as_secs(),
            retry: FileRetry {
                attempts: config.retry.attempts,
                initial_delay_ms: config.retry.initial_delay.as_millis() as u64,
                factor: config.retry.factor,
                max_delay_ms: config.retry.max_delay.as_millis() as u64,
            },
            session_limit: config.session_limit,
            recent_window_secs: config.recent_window.as_secs(),
            event_buffer: config.event_buffer,
            logs_dir: config.logs_dir.clone(),
        }
    }
}

impl From<FileConfig> for SyncConfig {
    fn from(file: FileConfig) -> Self {
        Self {
            server_url: file.server_url,
            api_token: file.api_token.filter(|t| !t.trim().is_empty()),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            retry: RetryPolicy {
                attempts: file.retry.attempts,
                initial_delay: Duration::from_millis(file.retry.initial_delay_ms),
                factor: file.retry.factor,
                max_delay: Duration::from_millis(file.retry.max_delay_ms),
            },
            session_limit: file.session_limit,
            recent_window: Duration::from_secs(file.recent_window_secs),
            event_buffer: file.event_buffer,
            logs_dir: file.logs_dir,
        }
    }
}

impl SyncConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let overlay: Value = serde_json::from_str(&raw)?;
        Self::default().merged(&overlay)
    }

    fn merged(&self, overlay: &Value) -> Result<Self> {
        let mut base = serde_json::to_value(FileConfig::from(self))?;
        deep_merge(&mut base, overlay);
        let file: FileConfig = serde_json::from_value(base)
            .map_err(|e| SyncError::InvalidConfig(format!("config file: {e}")))?;
        Ok(file.into())
    }

    /// Applies `TETHER_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = read("TETHER_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(token) = read("TETHER_API_TOKEN") {
            self.api_token = Some(token);
        }
        if let Some(raw) = read("TETHER_SESSION_LIMIT") {
            self.session_limit = parse_number("TETHER_SESSION_LIMIT", &raw)?;
        }
        if let Some(raw) = read("TETHER_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_number("TETHER_RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read("TETHER_REQUEST_TIMEOUT_SECS") {
            self.request_timeout =
                Duration::from_secs(parse_number("TETHER_REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(dir) = read("TETHER_LOGS_DIR") {
            self.logs_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SyncError::InvalidConfig("server_url is empty".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| SyncError::InvalidConfig(format!("{key}={raw:?} is not a valid number")))
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
