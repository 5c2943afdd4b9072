//! # Connection Manager
//!
//! Owns the one push connection of the process and keeps it alive.
//!
//! ```text
//! Disconnected → Connecting → Connected → (Reconnecting ⇄ Connected) → Closed
//! ```
//!
//! Inbound messages are split into frames, resolved against the static
//! event-type table and republished on the [`Dispatcher`]. Nothing else leaves
//! this module: consumers see a [`ConnectionStatus`] and a degraded flag, never
//! the socket or raw payloads.
//!
//! ## Failure handling
//!
//! - Connect failures, remote closes, read errors, inactivity and malformed
//!   frames all end the current connection and move to `Reconnecting`.
//! - Reconnect delays follow [`Backoff`] (exponential, full jitter). There is
//!   no retry limit; only [`ConnectionManager::disconnect`] stops the loop.
//!   Backoff restarts from the base only after a connection delivered
//!   something usable, so a server that accepts and hangs up keeps backing off.
//! - Unknown frame types are dropped with a debug line and do not disturb
//!   the connection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::configs::sync_config::SyncConfig;
use crate::core::backoff::Backoff;
use crate::core::dispatcher::Dispatcher;
use crate::core::event::{Frame, FrameError};
use crate::core::transport::{Connector, Inbound, InboundStream};

/// Lifecycle states of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Frames are flowing.
    Connected,
    /// Lost the connection, waiting out backoff or retrying.
    Reconnecting,
    /// Stopped by `disconnect`.
    Closed,
}

/// Why a live connection ended.
enum PumpExit {
    Cancelled,
    Dropped(String),
}

struct Inner {
    dispatcher: Dispatcher,
    connector: Arc<dyn Connector>,
    status_tx: watch::Sender<ConnectionStatus>,
    consecutive_failures: AtomicU32,
    frames_dispatched: AtomicU64,
    base_delay: Duration,
    max_delay: Duration,
    degraded_after: u32,
    silent_failure_timeout: Duration,
}

/// # Connection Manager
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    running: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    /// Runtime current at construction, for `connect` calls made off-runtime.
    runtime: Option<Handle>,
}

impl ConnectionManager {
    pub fn new(config: &SyncConfig, dispatcher: Dispatcher, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                connector,
                status_tx,
                consecutive_failures: AtomicU32::new(0),
                frames_dispatched: AtomicU64::new(0),
                base_delay: config.reconnect_base_delay(),
                max_delay: config.reconnect_max_delay(),
                degraded_after: config.degraded_after_attempts.max(1),
                silent_failure_timeout: config.silent_failure_timeout(),
            }),
            running: Mutex::new(None),
            runtime: Handle::try_current().ok(),
        }
    }

    /// # Connect
    ///
    /// Spawns the connection loop. A no-op while a loop is already running.
    /// Calling it after `disconnect` starts a fresh loop. Outside a runtime
    /// the loop goes to the runtime the manager was created in; with neither
    /// the call is logged and the status stays as it was.
    pub fn connect(&self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((handle, token)) = running.as_ref() {
            if !handle.is_finished() && !token.is_cancelled() {
                tracing::debug!("Connection loop already running for {}", self.inner.connector.describe());
                return;
            }
        }

        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            tracing::error!("Cannot connect to {}: no tokio runtime", self.inner.connector.describe());
            return;
        };
        let token = CancellationToken::new();
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        self.inner.set_status(ConnectionStatus::Connecting, &token);
        let handle = runtime.spawn(Arc::clone(&self.inner).run(token.clone()));
        *running = Some((handle, token));
    }

    /// # Disconnect
    ///
    /// Stops the loop and marks the connection `Closed` immediately. The
    /// background task winds down on its own; use [`Self::shutdown`] to wait.
    pub fn disconnect(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, token)) = running.as_ref() {
            if !token.is_cancelled() {
                tracing::info!("Disconnecting from {}", self.inner.connector.describe());
                token.cancel();
            }
        }
        self.inner.status_tx.send_replace(ConnectionStatus::Closed);
    }

    /// Disconnects and waits for the background task to finish.
    pub async fn shutdown(&self) {
        self.disconnect();
        let taken = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((handle, _)) = taken {
            if let Err(e) = handle.await {
                tracing::error!("Connection task ended abnormally: {}", e);
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// True once consecutive failed attempts reach the configured threshold.
    /// A connection that closes before delivering a heartbeat or a
    /// well-formed message counts as a failed attempt. Cleared by the first
    /// such message on a later connection.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures() >= self.inner.degraded_after
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Frames successfully resolved and handed to the dispatcher.
    pub fn frames_dispatched(&self) -> u64 {
        self.inner.frames_dispatched.load(Ordering::Relaxed)
    }

    /// Watch channel for status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some((_, token)) = self.running.get_mut().unwrap_or_else(|p| p.into_inner()).as_ref() {
            token.cancel();
        }
    }
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus, token: &CancellationToken) {
        // Once cancelled, only `Closed` may be published.
        if token.is_cancelled() && status != ConnectionStatus::Closed {
            return;
        }
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::info!("Connection status: {:?} -> {:?}", previous, status);
        }
    }

    /// Primary execution loop with reconnection logic.
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut backoff = Backoff::new(self.base_delay, self.max_delay);
        let endpoint = self.connector.describe();

        loop {
            tracing::info!("Connecting to {}", endpoint);
            let attempt = tokio::select! {
                _ = token.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(stream) => {
                    self.set_status(ConnectionStatus::Connected, &token);

                    let mut healthy = false;
                    match self.pump(stream, &token, &mut healthy).await {
                        PumpExit::Cancelled => break,
                        PumpExit::Dropped(reason) if healthy => {
                            backoff.reset();
                            tracing::warn!("Connection to {} lost: {}", endpoint, reason);
                        }
                        PumpExit::Dropped(reason) => {
                            // Dropped before delivering anything usable.
                            self.record_failure(&endpoint, &format!("dropped right after connect: {}", reason));
                        }
                    }
                }
                Err(e) => self.record_failure(&endpoint, &e.to_string()),
            }

            self.set_status(ConnectionStatus::Reconnecting, &token);
            let delay = backoff.next_delay();
            tracing::debug!("Reconnecting in {}ms (attempt {})", delay.as_millis(), backoff.attempt());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_status(ConnectionStatus::Closed, &token);
        tracing::info!("Connection loop for {} stopped", endpoint);
    }

    fn record_failure(&self, endpoint: &str, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == self.degraded_after {
            tracing::error!(
                "Failed to connect to {} {} times in a row; entering degraded mode: {}",
                endpoint,
                failures,
                reason
            );
        } else {
            tracing::error!("Failed to connect to {}: {}", endpoint, reason);
        }
    }

    /// Reads one live connection until it ends or the token is cancelled.
    /// `healthy` flips once a heartbeat or a well-formed message arrives,
    /// which is when the failure streak is cleared.
    async fn pump(&self, mut stream: InboundStream, token: &CancellationToken, healthy: &mut bool) -> PumpExit {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return PumpExit::Cancelled,
                next = timeout(self.silent_failure_timeout, stream.next()) => next,
            };

            let inbound = match next {
                Err(_) => {
                    return PumpExit::Dropped(format!(
                        "no traffic for {}s",
                        self.silent_failure_timeout.as_secs()
                    ))
                }
                Ok(None) => return PumpExit::Dropped("stream ended".to_string()),
                Ok(Some(Err(e))) => return PumpExit::Dropped(e.to_string()),
                Ok(Some(Ok(inbound))) => inbound,
            };

            let text = match inbound {
                Inbound::Heartbeat => {
                    self.mark_healthy(healthy);
                    continue;
                }
                Inbound::Close => return PumpExit::Dropped("closed by remote host".to_string()),
                Inbound::Text(text) => text,
                Inbound::Binary(bin) => match String::from_utf8(bin) {
                    Ok(text) => text,
                    Err(_) => return PumpExit::Dropped(FrameError::Utf8.to_string()),
                },
            };

            if let Err(e) = self.dispatch_text(&text) {
                return PumpExit::Dropped(format!("protocol error: {}", e));
            }
            self.mark_healthy(healthy);
        }
    }

    fn mark_healthy(&self, healthy: &mut bool) {
        if !*healthy {
            *healthy = true;
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    /// Parses every frame in `text` and republishes the known ones.
    fn dispatch_text(&self, text: &str) -> Result<(), FrameError> {
        for decoded in Frame::decode_all(text) {
            let frame = decoded?;
            let frame_type = frame.frame_type.clone();
            match frame.into_event() {
                Some(event) => {
                    tracing::trace!("Dispatching {} for scope {}", event.kind, event.scope_id);
                    self.dispatcher.emit_event(&event);
                    self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
                }
                None => tracing::debug!("Dropping frame with unknown type '{}'", frame_type),
            }
        }
        Ok(())
    }
}
