use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use tether_core::{
    DirectoryStatus, NotificationSink, SyncConfig, SyncEngine, Toast, ToastVariant, GLOBAL_SCOPE,
};
use tether_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use tether_types::Session;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Mirror an agent server's sessions and workspace state")]
struct Cli {
    /// JSON config file; keys override the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "TETHER_SERVER_URL")]
    server: Option<String>,
    #[arg(long, global = true, env = "TETHER_API_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap global state and print readiness and known projects.
    Status,
    /// Print the listed sessions of a directory as JSON.
    Sessions {
        #[arg(long)]
        directory: String,
        /// Widen the list by this many sessions before printing.
        #[arg(long)]
        more: Option<usize>,
    },
    /// Follow the event feed and log store changes until interrupted.
    Watch {
        #[arg(long = "directory", required = true)]
        directories: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct SessionRow {
    id: String,
    title: String,
    directory: Option<String>,
    updated: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionRow {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            directory: session.directory.clone(),
            updated: i64::try_from(session.last_activity_ms())
                .ok()
                .and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(token) = cli.token {
        config.api_token = Some(token);
    }

    let (_log_guard, log_info) = init_process_logging(ProcessKind::Cli, &config.logs_dir, 14)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "cli.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    let (toast_tx, toast_rx) = mpsc::unbounded_channel::<Toast>();
    let sink: Arc<dyn NotificationSink> = Arc::new(toast_tx);
    let engine = SyncEngine::connect(&config, sink, ProcessKind::Cli)
        .with_context(|| format!("connecting to {}", config.server_url))?;

    match cli.command {
        Command::Status => {
            engine.global().bootstrap().await?;
            let state = engine.global().snapshot();
            let report = serde_json::json!({
                "server": config.server_url,
                "ready": state.ready,
                "home": state.path.home,
                "directory": state.path.directory,
                "projects": state
                    .projects
                    .iter()
                    .map(|p| serde_json::json!({"id": p.id, "worktree": p.worktree, "name": p.name}))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sessions { directory, more } => {
            engine.global().bootstrap().await?;
            let sync = engine.session_sync(&directory);
            tokio::time::timeout(
                config.request_timeout,
                sync.store().wait_for(DirectoryStatus::Complete),
            )
            .await
            .with_context(|| format!("timed out waiting for {directory} to load"))?;
            if let Some(count) = more {
                sync.fetch(count).await?;
            }
            let rows: Vec<SessionRow> = sync
                .store()
                .read(|state| state.session.iter().map(SessionRow::from).collect());
            let report = serde_json::json!({
                "directory": sync.store().key(),
                "sessions": rows,
                "has_more": sync.has_more(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Watch { directories } => {
            watch(engine, directories, toast_rx).await?;
        }
    }

    Ok(())
}

async fn watch(
    engine: SyncEngine,
    directories: Vec<String>,
    mut toasts: mpsc::UnboundedReceiver<Toast>,
) -> anyhow::Result<()> {
    let mut changes = engine.subscribe_changes();
    let mut health = engine.feed().watch_health();
    let _ = engine.start().await;
    for directory in &directories {
        let store = engine.directory(directory);
        info!(directory = %store.key(), "watching directory");
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; stopping");
                break;
            }
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *health.borrow_and_update();
                info!(feed = status.as_str(), "event feed health changed");
            }
            change = changes.recv() => match change {
                Ok(change) if change.scope == GLOBAL_SCOPE => {
                    let global = engine.global();
                    info!(
                        revision = change.revision,
                        ready = global.is_ready(),
                        error = %global.error().unwrap_or_default(),
                        "global state changed"
                    );
                }
                Ok(change) => {
                    if let Some(store) = engine.registry().get(&change.scope) {
                        let sessions = store.read(|s| s.session.len());
                        info!(
                            directory = %store.key(),
                            revision = change.revision,
                            status = store.status().as_str(),
                            sessions,
                            "directory changed"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(toast) = toasts.recv() => {
                match toast.variant {
                    ToastVariant::Error | ToastVariant::Warning => {
                        tracing::warn!(title = %toast.title, persistent = toast.persistent, "{}", toast.description)
                    }
                    _ => info!(title = %toast.title, "{}", toast.description),
                }
            }
            _ = heartbeat.tick() => {
                info!(directories = ?engine.registry().directories(), "still watching");
            }
        }
    }

    engine.stop().await;
    Ok(())
}
