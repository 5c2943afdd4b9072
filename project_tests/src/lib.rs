//! A local push server and polling helpers for the end-to-end tests under `tests/`.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use lib_sync::core::{CourseSnapshot, SyncEngine, SyncEvent};
use lib_sync::SyncConfig;

pub const WAIT: Duration = Duration::from_secs(5);

/// Accepts WebSocket clients on an ephemeral port and hands each one to the test.
pub struct PushServer {
    pub url: String,
    clients: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl PushServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/push", listener.local_addr()?);
        let (tx, clients) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                match accept_async(stream).await {
                    Ok(ws) => {
                        if tx.send(ws).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("handshake failed: {}", e),
                }
            }
        });
        Ok(Self { url, clients })
    }

    /// Waits for the next client connection.
    pub async fn next_client(&mut self) -> Result<PushClient> {
        let ws = tokio::time::timeout(WAIT, self.clients.recv())
            .await
            .context("no client connected in time")?
            .context("accept loop stopped")?;
        Ok(PushClient { ws })
    }
}

pub struct PushClient {
    ws: WebSocketStream<TcpStream>,
}

impl PushClient {
    pub async fn send(&mut self, event: &SyncEvent) -> Result<()> {
        self.send_raw(&event.to_frame().encode()).await
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    /// Resolves once the engine side goes away.
    pub async fn wait_closed(&mut self) -> Result<()> {
        tokio::time::timeout(WAIT, async {
            while let Some(msg) = self.ws.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await
        .context("client never disconnected")
    }
}

/// Small delays so reconnects and debouncing happen within a test's patience.
pub fn config(url: &str) -> SyncConfig {
    SyncConfig {
        url: url.to_string(),
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 200,
        operation_timeout_ms: 2_000,
        progress_min_interval_ms: 0,
        scope_linger_ms: 200,
        ..Default::default()
    }
}

/// Polls `check` until it holds or [`WAIT`] runs out.
pub async fn eventually(what: &str, check: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Course `course_id` with chapter `<course_id>-ch1` holding video `<course_id>-v1`.
pub fn seed(engine: &SyncEngine, course_id: &str) -> Result<()> {
    let chapter = format!("{}-ch1", course_id);
    let snapshot: CourseSnapshot = serde_json::from_value(json!({
        "course": {"id": course_id, "title": format!("Course {}", course_id)},
        "chapters": [{"id": chapter, "courseId": course_id, "title": "Intro", "order": 1}],
        "videos": [{"id": format!("{}-v1", course_id), "chapterId": chapter, "order": 1, "title": "Welcome", "status": "ready"}],
        "fetchedAt": 1
    }))?;
    engine.cache().hydrate(course_id, snapshot);
    Ok(())
}

