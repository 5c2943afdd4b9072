//! # Sync Client
//!
//! Hosts a [`SyncEngine`] outside any UI: opens the configured courses,
//! answers refetch requests from snapshot files, and periodically logs what
//! the normalized cache holds. Useful against `push_dummy` or a staging push
//! endpoint to watch the engine converge.
//!
//! Configuration: defaults ← `sync_client.conf` (JSON) ← environment/CLI.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use static_init::dynamic;
use tokio::signal;
use tracing::{info, warn};

use lib_sync::core::{engine, ConnectionStatus, Entity, ScopeHandle, SyncEngine, WsConnector};
use sync_servers::client_logic::config::load_config;
use sync_servers::client_logic::logger::setup_logging;
use sync_servers::client_logic::snapshots::{serve_refetches, SnapshotStore};

// load .env files before anything else
#[dynamic]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    let log_dir = config.log_dir.clone().unwrap_or_else(|| "./logs".into());
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_dir, &log_level, "sync_client")?;

    let sync_config = config.sync_config();
    info!("{}", sync_config);
    let connector = std::sync::Arc::new(WsConnector::new(sync_config.url.clone()));
    let engine = engine::init(sync_config, connector)?;

    if let Some(requests) = engine.take_refetch_requests() {
        match config.snapshot_dir.clone() {
            Some(dir) => {
                tokio::spawn(serve_refetches(engine.clone(), requests, SnapshotStore::new(dir)));
            }
            None => {
                warn!("No snapshot directory configured; stale collections will not be refetched");
                drop(requests);
            }
        }
    }

    if config.courses.is_empty() {
        warn!("No courses configured; the connection stays closed until one is opened");
    }
    let scopes: Vec<ScopeHandle> = config.courses.iter().map(|course| engine.open_scope(course)).collect();
    if let Some(dir) = config.snapshot_dir.clone() {
        let store = SnapshotStore::new(dir);
        for scope in &scopes {
            if let Err(e) = store.hydrate(&engine, scope.scope_id()).await {
                warn!("Initial load of {} failed: {:#}", scope.scope_id(), e);
            }
        }
    }

    spawn_status_monitor(engine.clone());

    let every = Duration::from_secs(config.dump_interval_seconds.unwrap_or(30).max(1));
    let mut ticker = tokio::time::interval(every);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for scope in &scopes {
                    log_scope(&engine, scope);
                }
            }
            _ = &mut shutdown => {
                warn!("Shutdown signal received. Closing scopes...");
                break;
            }
        }
    }

    drop(scopes);
    engine::teardown().await?;
    info!("Sync client stopped");
    Ok(())
}

/// Logs every status transition, flagging degraded mode.
fn spawn_status_monitor(engine: SyncEngine) {
    let mut status = engine.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if engine.is_degraded() {
                warn!("Connection {:?} (degraded)", current);
            } else {
                info!("Connection {:?}", current);
            }
            if current == ConnectionStatus::Closed {
                break;
            }
        }
    });
}

fn log_scope(engine: &SyncEngine, scope: &ScopeHandle) {
    let Some(Entity::Course(course)) = engine.get_entity(scope.scope_id()) else {
        info!("[{}] not loaded", scope.scope_id());
        return;
    };
    info!("[{}] {} ({} chapters)", course.id, course.title, course.chapter_ids.len());
    for chapter_id in &course.chapter_ids {
        let Some(chapter) = engine.cache().get_chapter(chapter_id) else {
            continue;
        };
        let videos: Vec<String> = chapter
            .video_ids
            .iter()
            .filter_map(|id| engine.cache().get_video_slot(id))
            .map(|slot| {
                let video = slot.record();
                match video.upload_progress {
                    Some(p) if slot.is_provisional() => format!("{} [{}%]", video.title, p),
                    _ => format!("{} ({:?})", video.title, video.status),
                }
            })
            .collect();
        info!("[{}]   {}. {}: {}", course.id, chapter.order, chapter.title, videos.join(", "));
    }
}

/// Resolves on CTRL+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
