//! # Push Dummy
//!
//! A scripted push server for local runs of `sync_client`. Every WebSocket
//! client connecting to `/push` gets the script replayed, one frame per
//! interval, then the connection is kept open with periodic pings.
//!
//! The script is a JSON-lines file of wire frames
//! (`{"type", "scopeId", "operationId"?, "data", "timestamp"}`). Frames with
//! `timestamp: 0` are stamped at send time. Without `--script` a built-in demo
//! for course `c1` is used.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{debug, info, warn};

use lib_sync::core::{EventKind, Frame, SyncEvent};
use sync_servers::client_logic::logger::setup_logging;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Scripted push server for the course sync client", version)]
struct Args {
    #[clap(long, env = "PUSH_DUMMY_PORT", default_value_t = 9010, help = "Port to listen on.")]
    port: u16,

    #[clap(long, env = "PUSH_DUMMY_SCRIPT", help = "JSON-lines file of frames to replay.")]
    script: Option<PathBuf>,

    #[clap(long, env = "PUSH_DUMMY_INTERVAL_MS", default_value_t = 500, help = "Delay between frames.")]
    interval_ms: u64,

    #[clap(long, env = "PUSH_DUMMY_REPEAT", help = "Replay the script forever instead of once.")]
    repeat: bool,

    #[clap(long, env = "PUSH_DUMMY_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    log_dir: PathBuf,

    #[clap(long, env = "PUSH_DUMMY_LOG_LEVEL", default_value = "info", help = "Logging level.")]
    log_level: String,
}

struct AppState {
    frames: Vec<Frame>,
    interval: Duration,
    repeat: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = setup_logging(&args.log_dir, &args.log_level, "push_dummy")?;

    let frames = match &args.script {
        Some(path) => load_script(path)?,
        None => demo_script(),
    };
    info!("Loaded {} frames", frames.len());

    let state = Arc::new(AppState {
        frames,
        interval: Duration::from_millis(args.interval_ms),
        repeat: args.repeat,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/push", get(ws_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Push dummy live at ws://{}/push", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn load_script(path: &Path) -> Result<Vec<Frame>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| Frame::decode(line).with_context(|| format!("{}:{}", path.display(), n + 1)))
        .collect()
}

/// The upload + batch-save walkthrough for course `c1`.
fn demo_script() -> Vec<Frame> {
    let events = [
        SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "ch1", "courseId": "c1", "title": "Intro 2", "order": 1}))
            .with_operation("op-rename"),
        SyncEvent::new(EventKind::VideoDeleteComplete, "c1", json!({"id": "v1"})).with_operation("op-delete"),
        SyncEvent::new(EventKind::UploadProgress, "c1", json!({"progress": 10})).with_operation("op-upload"),
        SyncEvent::new(EventKind::UploadProgress, "c1", json!({"progress": 55})).with_operation("op-upload"),
        SyncEvent::new(
            EventKind::UploadProgress,
            "c1",
            json!({
                "progress": 100,
                "final": true,
                "video": {"id": "v-42", "chapterId": "ch1", "order": 2, "title": "f1.mp4", "status": "ready"}
            }),
        )
        .with_operation("op-upload"),
        SyncEvent::new(
            EventKind::UploadComplete,
            "c1",
            json!({"video": {"id": "v-42", "chapterId": "ch1", "order": 2, "title": "f1.mp4", "status": "ready"}}),
        )
        .with_operation("op-upload"),
        SyncEvent::new(EventKind::CollectionInvalidated, "c1", json!({"collection": "videos"})),
    ];
    events
        .iter()
        .map(|event| {
            let mut frame = event.to_frame();
            frame.timestamp = 0;
            frame
        })
        .collect()
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    info!("Client {} connected", addr);
    'replay: loop {
        for frame in &state.frames {
            let mut frame = frame.clone();
            if frame.timestamp == 0 {
                frame.timestamp = chrono::Utc::now().timestamp_millis();
            }
            if socket.send(Message::Text(frame.encode().into())).await.is_err() {
                break 'replay;
            }
            debug!("Sent {} to {}", frame.frame_type, addr);
            tokio::time::sleep(state.interval).await;
        }
        if !state.repeat {
            break;
        }
    }

    // Keep the connection alive so the client's inactivity watchdog stays quiet.
    let mut keepalive = tokio::time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Client {} errored: {}", addr, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    info!("Client {} disconnected", addr);
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    warn!("Shutdown signal received. Closing server...");
}
