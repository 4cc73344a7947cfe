use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToastAction {
    pub label: String,
    /// Command identifier the UI binds to a handler.
    pub action: String,
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub id: String,
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
    pub persistent: bool,
    pub actions: Vec<ToastAction>,
}

impl Toast {
    pub fn new(variant: ToastVariant, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            variant,
            persistent: false,
            actions: Vec::new(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ToastVariant::Error, title, description)
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_action(mut self, label: impl Into<String>, action: impl Into<String>) -> Self {
        self.actions.push(ToastAction {
            label: label.into(),
            action: action.into(),
        });
        self
    }
}

/// Where user-facing failures go. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn show(&self, toast: Toast);
}

/// Writes toasts to the log only. Used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn show(&self, toast: Toast) {
        match toast.variant {
            ToastVariant::Error => tracing::error!(
                title = %toast.title,
                persistent = toast.persistent,
                "{}",
                toast.description
            ),
            ToastVariant::Warning => {
                tracing::warn!(title = %toast.title, "{}", toast.description)
            }
            _ => tracing::info!(title = %toast.title, "{}", toast.description),
        }
    }
}

impl NotificationSink for mpsc::UnboundedSender<Toast> {
    fn show(&self, toast: Toast) {
        if self.send(toast).is_err() {
            tracing::debug!("toast receiver dropped");
        }
    }
}
