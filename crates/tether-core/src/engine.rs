//! Wires the stores, router and event feed for one server connection.

use std::sync::Arc;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::api::{EventSource, ServerApi};
use crate::change_bus::{ChangeBus, StoreChange};
use crate::config::SyncConfig;
use crate::directory::DirectoryStore;
use crate::error::Result;
use crate::feed::FeedRunner;
use crate::global::GlobalStore;
use crate::http::HttpServerApi;
use crate::notify::NotificationSink;
use crate::registry::{DirectoryRegistry, RegistryOptions};
use crate::router::EventRouter;
use crate::session_sync::SessionSync;

pub struct SyncEngine {
    process: ProcessKind,
    bus: ChangeBus,
    global: GlobalStore,
    registry: DirectoryRegistry,
    router: EventRouter,
    source: Arc<dyn EventSource>,
    feed: FeedRunner,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        api: Arc<dyn ServerApi>,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn NotificationSink>,
        process: ProcessKind,
    ) -> Self {
        let bus = ChangeBus::with_capacity(config.event_buffer);
        let global = GlobalStore::new(api.clone(), config.retry.clone(), bus.clone(), process);
        let registry = DirectoryRegistry::new(
            api,
            global.clone(),
            sink,
            bus.clone(),
            RegistryOptions {
                retry: config.retry.clone(),
                session_limit: config.session_limit,
                recent_window: config.recent_window,
                process,
            },
        );
        let router = EventRouter::new(registry.clone());
        Self {
            process,
            bus,
            global,
            registry,
            router,
            source,
            feed: FeedRunner::new(config.retry.clone(), process),
        }
    }

    /// Builds an engine talking HTTP to `config.server_url`.
    pub fn connect(
        config: &SyncConfig,
        sink: Arc<dyn NotificationSink>,
        process: ProcessKind,
    ) -> Result<Self> {
        let http = Arc::new(HttpServerApi::from_config(config)?);
        Ok(Self::new(config, http.clone(), http, sink, process))
    }

    /// Opens the event feed and starts the global bootstrap. Directory stores
    /// bootstrap on first access.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "engine.start",
                component: "engine",
                ..Default::default()
            },
        );
        self.feed.start(self.source.clone(), self.router.clone()).await;
        let global = self.global.clone();
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(handle.spawn(async move {
            let _ = global.bootstrap().await;
        }))
    }

    pub async fn stop(&self) {
        self.feed.stop().await;
    }

    pub fn global(&self) -> &GlobalStore {
        &self.global
    }

    pub fn registry(&self) -> &DirectoryRegistry {
        &self.registry
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn feed(&self) -> &FeedRunner {
        &self.feed
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.bus.subscribe()
    }

    pub fn directory(&self, directory: &str) -> Arc<DirectoryStore> {
        self.registry.child(directory)
    }

    pub fn session_sync(&self, directory: &str) -> SessionSync {
        SessionSync::new(self.registry.clone(), directory)
    }
}
