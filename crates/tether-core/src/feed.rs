//! Keeps a subscription to the server event feed open and routes every
//! envelope in delivery order.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::api::EventSource;
use crate::retry::RetryPolicy;
use crate::router::EventRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    Healthy,
    Degraded,
    Recovering,
}

impl FeedHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedHealth::Healthy => "healthy",
            FeedHealth::Degraded => "degraded",
            FeedHealth::Recovering => "recovering",
        }
    }
}

struct FeedState {
    running: bool,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

pub struct FeedRunner {
    state: Mutex<FeedState>,
    health_tx: watch::Sender<FeedHealth>,
    backoff: RetryPolicy,
    process: ProcessKind,
}

impl FeedRunner {
    /// `backoff` paces resubscription; its attempt count is ignored.
    pub fn new(backoff: RetryPolicy, process: ProcessKind) -> Self {
        let (health_tx, _) = watch::channel(FeedHealth::Recovering);
        Self {
            state: Mutex::new(FeedState {
                running: false,
                stop_tx: None,
                task: None,
            }),
            health_tx,
            backoff,
            process,
        }
    }

    pub fn health(&self) -> FeedHealth {
        *self.health_tx.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<FeedHealth> {
        self.health_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn start(&self, source: Arc<dyn EventSource>, router: EventRouter) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let health_tx = self.health_tx.clone();
        let backoff = self.backoff.clone();
        let process = self.process;

        let task = tokio::spawn(async move {
            let mut failures: u32 = 0;
            let set_health = |status: FeedHealth| {
                let changed = health_tx.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    *current = status;
                    true
                });
                if changed {
                    let level = match status {
                        FeedHealth::Degraded => Level::WARN,
                        _ => Level::INFO,
                    };
                    emit_event(
                        level,
                        process,
                        ObservabilityEvent {
                            event: "feed.health",
                            component: "feed",
                            status: Some(status.as_str()),
                            ..Default::default()
                        },
                    );
                }
            };

            set_health(FeedHealth::Recovering);

            'outer: loop {
                let stream = match source.subscribe().await {
                    Ok(stream) => {
                        failures = 0;
                        set_health(FeedHealth::Healthy);
                        stream
                    }
                    Err(e) => {
                        tracing::warn!("Feed failed to subscribe to server events: {}", e);
                        set_health(FeedHealth::Degraded);
                        failures = failures.saturating_add(1);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff.delay_for(failures)) => {},
                            _ = &mut stop_rx => break 'outer,
                        }
                        continue;
                    }
                };

                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break 'outer,
                        maybe = stream.next() => {
                            let Some(next_item) = maybe else {
                                tracing::info!("Feed stream ended; attempting resubscribe");
                                set_health(FeedHealth::Recovering);
                                break;
                            };
                            match next_item {
                                Ok(envelope) => {
                                    router.dispatch(&envelope);
                                }
                                Err(e) => {
                                    tracing::warn!("Feed stream error: {}", e);
                                    set_health(FeedHealth::Degraded);
                                    break;
                                }
                            }
                        }
                    }
                }

                failures = failures.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff.delay_for(failures)) => {},
                    _ = &mut stop_rx => break 'outer,
                }
            }

            tracing::info!("Feed task stopped");
        });

        state.running = true;
        state.stop_tx = Some(stop_tx);
        state.task = Some(task);
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        state.running = false;
    }
}
