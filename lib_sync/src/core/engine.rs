//! # Sync Engine
//!
//! Wires the components into one process-wide engine:
//!
//! ```text
//! Connector → ConnectionManager → Dispatcher ─┬→ NormalizedCache (per scope)
//!                                             ├→ UploadProgressStream (per scope)
//!                                             └→ OperationTracker (per scope)
//! ```
//!
//! A scope is one open course. [`SyncEngine::open_scope`] hands out a
//! [`ScopeHandle`]; handles of the same course share one set of handlers.
//! When the last handle closes, the handlers are removed and the scope's
//! operations discarded right away, while the cached data lingers for
//! `scope_linger` in case the course is reopened. The push connection is
//! opened by the first scope and closed once no scope is left, lingering ones
//! included.
//!
//! The engine is usable as an owned value, or as the module-level singleton
//! through [`init`], [`global`] and [`teardown`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::configs::sync_config::SyncConfig;
use crate::core::cache::{NormalizedCache, RefetchRequest};
use crate::core::connection_manager::{ConnectionManager, ConnectionStatus};
use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::core::model::{Collection, Entity, Video};
use crate::core::operation_tracker::{OperationId, OperationOutcome, OperationTracker};
use crate::core::registry::{Acquired, Registry};
use crate::core::transport::Connector;
use crate::core::upload_progress::UploadProgressStream;
use crate::error::SyncError;

/// What a mutation collaborator (REST call, form action) returns. The engine
/// only cares about `operation_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

struct EngineInner {
    config: SyncConfig,
    dispatcher: Dispatcher,
    tracker: OperationTracker,
    cache: Arc<NormalizedCache>,
    progress: Arc<UploadProgressStream>,
    connection: ConnectionManager,
    scopes: Registry,
    handlers: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl EngineInner {
    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cache first, then progress, then tracker: an outcome callback must see
    /// the cache state of the event that resolved it.
    fn attach(&self, scope_id: &str) {
        let mut subscriptions = self.cache.attach_scope(&self.dispatcher, scope_id);
        subscriptions.extend(self.progress.attach_scope(&self.dispatcher, scope_id));
        subscriptions.extend(self.tracker.attach_scope(&self.dispatcher, scope_id));
        self.handlers().insert(scope_id.to_string(), subscriptions);
    }

    fn detach(&self, scope_id: &str) {
        let removed = self.handlers().remove(scope_id);
        if let Some(subscriptions) = removed {
            for subscription in &subscriptions {
                subscription.unsubscribe();
            }
        }
        self.tracker.discard_scope(scope_id);
        self.progress.forget_scope(scope_id);
    }
}

/// # Sync Engine
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Builds an engine over any transport. Nothing connects until the first
    /// scope is opened.
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Result<Self, SyncError> {
        config.validate()?;
        let dispatcher = Dispatcher::new();
        let cache = Arc::new(NormalizedCache::new());
        let progress = Arc::new(UploadProgressStream::new(
            Arc::clone(&cache),
            config.progress_min_interval(),
        ));
        let connection = ConnectionManager::new(&config, dispatcher.clone(), connector);
        let scopes = Registry::new(config.scope_linger());
        tracing::info!("Sync engine created: {}", config);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                dispatcher,
                tracker: OperationTracker::new(),
                cache,
                progress,
                connection,
                scopes,
                handlers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Builds an engine that pushes over a WebSocket to `config.url`.
    #[cfg(feature = "ws")]
    pub fn with_websocket(config: SyncConfig) -> Result<Self, SyncError> {
        let connector = Arc::new(crate::core::transport::WsConnector::new(config.url.clone()));
        Self::new(config, connector)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.inner.tracker
    }

    pub fn cache(&self) -> &Arc<NormalizedCache> {
        &self.inner.cache
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.connection.is_degraded()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.watch_status()
    }

    /// The queue of collections that need a direct fetch. The host answers
    /// each request with [`NormalizedCache::hydrate`]. Only handed out once.
    pub fn take_refetch_requests(&self) -> Option<mpsc::UnboundedReceiver<RefetchRequest>> {
        self.inner.cache.take_refetch_requests()
    }

    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.inner.cache.get_entity(id)
    }

    pub fn get_ordered_children(&self, owner_id: &str) -> Vec<String> {
        self.inner.cache.get_ordered_children(owner_id)
    }

    /// Scopes with at least one open handle or still lingering.
    pub fn open_scopes(&self) -> usize {
        self.inner.scopes.len()
    }

    /// # Open Scope
    ///
    /// Opens (or joins) the scope of one course. The first scope starts the
    /// connection loop on the runtime the engine was built in.
    pub fn open_scope(&self, course_id: &str) -> ScopeHandle {
        match self.inner.scopes.acquire(course_id) {
            Acquired::Fresh => {
                tracing::info!("Opening scope {}", course_id);
                self.inner.attach(course_id);
                self.inner.connection.connect();
            }
            Acquired::Revived => {
                // Events were not applied while detached.
                tracing::info!("Reopening lingering scope {}", course_id);
                self.inner.attach(course_id);
                self.inner
                    .cache
                    .invalidate(course_id, Collection::All, "scope reopened");
                self.inner.connection.connect();
            }
            Acquired::Shared => {
                tracing::debug!("Joining open scope {}", course_id);
            }
        }
        ScopeHandle {
            engine: Arc::clone(&self.inner),
            scope_id: course_id.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Stops the connection and drops every scope's handlers, operations and
    /// cached data.
    pub async fn shutdown(&self) {
        let mut scopes: Vec<String> = self.inner.handlers().keys().cloned().collect();
        for scope in &scopes {
            self.inner.detach(scope);
        }
        // Lingering scopes have no handlers left but still hold cached data.
        for scope in self.inner.scopes.drain() {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        for scope in &scopes {
            self.inner.cache.evict_scope(scope);
        }
        self.inner.connection.shutdown().await;
        tracing::info!("Sync engine shut down ({} scopes dropped)", scopes.len());
    }
}

/// # Scope Handle
///
/// One holder's view of an open course. Dropping it closes it.
pub struct ScopeHandle {
    engine: Arc<EngineInner>,
    scope_id: String,
    closed: AtomicBool,
}

impl ScopeHandle {
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.engine.cache.get_entity(id)
    }

    pub fn get_ordered_children(&self, owner_id: &str) -> Vec<String> {
        self.engine.cache.get_ordered_children(owner_id)
    }

    pub fn invalidate(&self, collection: Collection) {
        self.engine.cache.invalidate(&self.scope_id, collection, "requested by client");
    }

    /// # Begin Compound
    ///
    /// Starts one user-facing action expecting `expected` completion events
    /// within the configured operation timeout. Anything but success also
    /// marks the whole scope stale so the host refetches it.
    pub fn begin_compound<F>(&self, expected: u32, on_complete: F) -> OperationId
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        let cache = Arc::clone(&self.engine.cache);
        let scope = self.scope_id.clone();
        self.engine.tracker.begin_scoped_operation(
            &self.scope_id,
            expected,
            self.engine.config.operation_timeout(),
            move |outcome| {
                if !outcome.is_success() {
                    cache.invalidate(&scope, Collection::All, "compound operation did not complete");
                }
                on_complete(outcome);
            },
        )
    }

    /// Attaches the operation id of one server call to a compound action.
    /// Returns `false` when the response carries no id or the parent is gone.
    pub fn link_sub_operation(&self, response: &MutationResponse, parent: &str) -> bool {
        match response.operation_id.as_deref() {
            Some(sub_id) if response.success => self.engine.tracker.link(sub_id, parent),
            _ => {
                tracing::warn!("Mutation for {} returned no usable operation id", parent);
                false
            }
        }
    }

    /// Tracks a single mutation whose response carries its own operation id.
    /// A failed response resolves immediately.
    pub fn track_mutation<F>(&self, response: &MutationResponse, expected: u32, on_complete: F) -> Option<OperationId>
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        let Some(operation_id) = response.operation_id.clone().filter(|_| response.success) else {
            on_complete(OperationOutcome::Failed {
                reason: "mutation rejected".to_string(),
                received: 0,
                expected,
            });
            return None;
        };
        self.engine.tracker.track_operation(
            &operation_id,
            Some(&self.scope_id),
            expected,
            self.engine.config.operation_timeout(),
            on_complete,
        );
        Some(operation_id)
    }

    /// # Start Upload
    ///
    /// Inserts a provisional video for an upload the server acknowledged
    /// under `operation_id` and returns its temporary id.
    pub fn start_upload(&self, operation_id: &str, chapter_id: &str, order: i64, title: &str, size_bytes: u64) -> String {
        let temp_id = format!("temp-{}", uuid::Uuid::new_v4());
        self.start_upload_as(&temp_id, operation_id, chapter_id, order, title, size_bytes);
        temp_id
    }

    /// Same as [`start_upload`](Self::start_upload) with a caller-chosen temporary id.
    pub fn start_upload_as(&self, temp_id: &str, operation_id: &str, chapter_id: &str, order: i64, title: &str, size_bytes: u64) {
        let record = Video::provisional(temp_id, chapter_id, order, title, size_bytes);
        self.engine.cache.insert_provisional(&self.scope_id, record, operation_id);
    }

    /// # Close
    ///
    /// Idempotent. Closing the last handle of a scope removes its handlers
    /// and discards its operations before returning.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let scope = self.scope_id.clone();
        let last = self.engine.scopes.release(&self.scope_id, move || {
            engine.cache.evict_scope(&scope);
            if engine.scopes.is_empty() {
                engine.connection.disconnect();
            }
        });
        if last {
            tracing::info!("Last handle of scope {} closed", self.scope_id);
            self.engine.detach(&self.scope_id);
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

static ENGINE: RwLock<Option<SyncEngine>> = RwLock::new(None);

/// Installs the process-wide engine.
pub fn init(config: SyncConfig, connector: Arc<dyn Connector>) -> Result<SyncEngine, SyncError> {
    let mut slot = ENGINE.write().unwrap_or_else(|p| p.into_inner());
    if slot.is_some() {
        return Err(SyncError::AlreadyInitialized);
    }
    let engine = SyncEngine::new(config, connector)?;
    *slot = Some(engine.clone());
    Ok(engine)
}

/// The process-wide engine.
pub fn global() -> Result<SyncEngine, SyncError> {
    ENGINE
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
        .ok_or(SyncError::NotInitialized)
}

/// Removes the process-wide engine and shuts it down. A later [`init`] starts
/// from scratch.
pub async fn teardown() -> Result<(), SyncError> {
    let engine = ENGINE
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .take()
        .ok_or(SyncError::NotInitialized)?;
    engine.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventKind, SyncEvent};
    use crate::core::model::{CourseSnapshot, VideoStatus};
    use crate::core::transport::{Inbound, InboundStream, TransportError};
    use futures_util::future::BoxFuture;
    use futures_util::{stream, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Feed = mpsc::UnboundedSender<Result<Inbound, TransportError>>;

    /// First connect yields a channel-fed stream; later connects fail.
    struct ChannelConnector {
        feed: Mutex<Option<mpsc::UnboundedReceiver<Result<Inbound, TransportError>>>>,
    }

    impl Connector for ChannelConnector {
        fn connect(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
            let rx = self.feed.lock().unwrap().take();
            Box::pin(async move {
                let rx = rx.ok_or_else(|| TransportError::Connect("feed exhausted".into()))?;
                let inbound = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
                Ok(inbound.boxed())
            })
        }
    }

    fn engine() -> (SyncEngine, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SyncConfig {
            operation_timeout_ms: 2_000,
            scope_linger_ms: 1_000,
            progress_min_interval_ms: 0,
            ..Default::default()
        };
        let connector = Arc::new(ChannelConnector {
            feed: Mutex::new(Some(rx)),
        });
        (SyncEngine::new(config, connector).unwrap(), tx)
    }

    fn push(feed: &Feed, event: SyncEvent) {
        feed.send(Ok(Inbound::Text(event.to_frame().encode()))).unwrap();
    }

    fn seed(engine: &SyncEngine) {
        let snapshot: CourseSnapshot = serde_json::from_value(json!({
            "course": {"id": "c1", "title": "Rust 101"},
            "chapters": [{"id": "ch1", "courseId": "c1", "title": "Intro", "order": 1}],
            "videos": [{"id": "v1", "chapterId": "ch1", "order": 1, "title": "Welcome", "status": "ready"}],
            "fetchedAt": 1
        }))
        .unwrap();
        engine.cache().hydrate("c1", snapshot);
    }

    fn accepted(op: &str) -> MutationResponse {
        MutationResponse {
            success: true,
            operation_id: Some(op.to_string()),
            data: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_part_save_signals_once() {
        let (engine, feed) = engine();
        let scope = engine.open_scope("c1");
        seed(&engine);

        let (done_tx, done_rx) = oneshot::channel();
        let reader = engine.clone();
        let save = scope.begin_compound(3, move |outcome| {
            // The cache already reflects the last event when this runs.
            let upload_visible = reader.get_entity("v-42").is_some();
            let _ = done_tx.send((outcome, upload_visible));
        });
        assert!(scope.link_sub_operation(&accepted("op-rename"), &save));
        assert!(scope.link_sub_operation(&accepted("op-delete"), &save));
        assert!(scope.link_sub_operation(&accepted("op-upload"), &save));
        scope.start_upload_as("temp-1", "op-upload", "ch1", 2, "f1.mp4", 1024);

        push(&feed, SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "ch1", "title": "Intro 2"})).with_operation("op-rename"));
        push(&feed, SyncEvent::new(EventKind::VideoDeleteComplete, "c1", json!({"id": "v1"})).with_operation("op-delete"));
        push(
            &feed,
            SyncEvent::new(
                EventKind::UploadComplete,
                "c1",
                json!({"tempId": "temp-1", "video": {"id": "v-42", "chapterId": "ch1", "order": 2, "title": "f1.mp4", "status": "ready"}}),
            )
            .with_operation("op-upload"),
        );

        let (outcome, upload_visible) = done_rx.await.unwrap();
        assert_eq!(outcome, OperationOutcome::Completed);
        assert!(upload_visible);
        assert_eq!(engine.cache().get_chapter("ch1").unwrap().title, "Intro 2");
        assert!(engine.get_entity("v1").is_none());
        assert_eq!(engine.get_ordered_children("ch1"), vec!["v-42"]);
        assert_eq!(engine.cache().get_video("v-42").unwrap().status, VideoStatus::Ready);
        assert_eq!(engine.tracker().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compound_timeout_requests_refetch() {
        let (engine, feed) = engine();
        let mut refetch = engine.take_refetch_requests().unwrap();
        let scope = engine.open_scope("c1");
        seed(&engine);

        let (done_tx, done_rx) = oneshot::channel();
        let save = scope.begin_compound(2, move |outcome| {
            let _ = done_tx.send(outcome);
        });
        scope.link_sub_operation(&accepted("op-a"), &save);
        scope.link_sub_operation(&accepted("op-b"), &save);
        push(&feed, SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "ch1", "title": "Renamed"})).with_operation("op-a"));

        assert_eq!(done_rx.await.unwrap(), OperationOutcome::TimedOut { received: 1, expected: 2 });
        let request = refetch.recv().await.unwrap();
        assert_eq!(request.scope_id, "c1");
        assert_eq!(request.collection, Collection::All);
        assert!(engine.cache().is_stale("c1", Collection::Chapters));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_last_handle_detaches_then_lingers() {
        let (engine, feed) = engine();
        let first = engine.open_scope("c1");
        let second = engine.open_scope("c1");
        seed(&engine);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        first.begin_compound(1, move |_| flag.store(true, Ordering::SeqCst));

        drop(second);
        assert_eq!(engine.dispatcher().handler_count(EventKind::ChapterUpdateComplete), 2);
        first.close();
        first.close();
        assert_eq!(engine.dispatcher().handler_count(EventKind::ChapterUpdateComplete), 0);
        assert_eq!(engine.tracker().in_flight(), 0);

        // Detached: pushes no longer reach the cache, data is still there.
        push(&feed, SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "ch1", "title": "Nope"})));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.cache().get_chapter("ch1").unwrap().title, "Intro");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(engine.get_entity("c1").is_none());
        assert_eq!(engine.open_scopes(), 0);
        assert_eq!(engine.status(), ConnectionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_linger_drops_lingering_scope() {
        let (engine, _feed) = engine();
        let handle = engine.open_scope("c1");
        seed(&engine);
        handle.close();
        assert_eq!(engine.open_scopes(), 1);
        assert!(engine.get_entity("c1").is_some());

        engine.shutdown().await;
        assert!(engine.get_entity("c1").is_none());
        assert!(engine.get_entity("v1").is_none());
        assert_eq!(engine.open_scopes(), 0);
        assert_eq!(engine.status(), ConnectionStatus::Closed);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.open_scopes(), 0);
        assert_eq!(engine.status(), ConnectionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scopes_do_not_see_each_other() {
        let (engine, feed) = engine();
        let _c1 = engine.open_scope("c1");
        let _c2 = engine.open_scope("c2");
        seed(&engine);

        push(&feed, SyncEvent::new(EventKind::ChapterDeleteComplete, "c2", json!({"id": "ch1"})));
        push(&feed, SyncEvent::new(EventKind::CourseUpdateComplete, "c1", json!({"title": "Rust 102"})));
        while engine.connection().frames_dispatched() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.get_entity("ch1").is_some());
        assert_eq!(engine.cache().get_course("c1").unwrap().title, "Rust 102");
    }

    #[tokio::test]
    async fn test_rejected_mutation_fails_immediately() {
        let (engine, _feed) = engine();
        let scope = engine.open_scope("c1");
        let (tx, rx) = oneshot::channel();
        let tracked = scope.track_mutation(&MutationResponse::default(), 1, move |outcome| {
            let _ = tx.send(outcome);
        });
        assert!(tracked.is_none());
        assert!(!rx.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_global_lifecycle() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<Inbound, TransportError>>();
        drop(tx);
        let connector: Arc<dyn Connector> = Arc::new(ChannelConnector {
            feed: Mutex::new(Some(rx)),
        });

        assert!(matches!(global(), Err(SyncError::NotInitialized)));
        init(SyncConfig::default(), Arc::clone(&connector)).unwrap();
        assert!(matches!(
            init(SyncConfig::default(), Arc::clone(&connector)),
            Err(SyncError::AlreadyInitialized)
        ));
        assert!(global().is_ok());
        teardown().await.unwrap();
        assert!(matches!(global(), Err(SyncError::NotInitialized)));
        assert!(matches!(teardown().await, Err(SyncError::NotInitialized)));
    }
}
