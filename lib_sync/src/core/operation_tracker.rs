//! # Operation Tracker
//!
//! Correlates one logical operation with the N completion events the server
//! will push for it and reports exactly one outcome: `Completed` once all N
//! arrived, `Failed` on a server-reported failure, or `TimedOut` when the
//! bounded wait elapses first. After that the record is gone and any further
//! event for the operation is a no-op.
//!
//! Timeouts follow the same pattern as a lingering subscription: a spawned
//! task sleeps and a `CancellationToken` aborts it when the operation
//! resolves earlier. The task goes to the current runtime, else to the one
//! the tracker was created in, so `begin_*` may be called from any thread.
//!
//! Compound actions (one "Save" fanning out into several server calls) begin
//! a parent operation and [`link`](OperationTracker::link) each sub-operation
//! id returned by the server to it. A linked id counts toward its parent once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::core::event::{EventKind, SyncEvent};

pub type OperationId = String;

/// Ids with events seen before anyone tracked or linked them are remembered,
/// up to this many, so a fast server cannot outrun the caller.
const UNCLAIMED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    TimedOut { received: u32, expected: u32 },
    Failed { reason: String, received: u32, expected: u32 },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Completed)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationOutcome::Completed => write!(f, "completed"),
            OperationOutcome::TimedOut { received, expected } => {
                write!(f, "timed out after {}/{} completions", received, expected)
            }
            OperationOutcome::Failed { reason, received, expected } => {
                write!(f, "failed after {}/{} completions: {}", received, expected, reason)
            }
        }
    }
}

/// What a single `register_completion` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionProgress {
    /// Counted; the operation is still waiting for more.
    Counted { received: u32, expected: u32 },
    /// This completion resolved the operation.
    Completed,
    /// A linked sub-operation that was already counted.
    Duplicate,
    /// No live operation with that id; remembered in case it is tracked later.
    Unclaimed,
}

pub type CompletionCallback = Box<dyn FnOnce(OperationOutcome) + Send + 'static>;

struct PendingOperation {
    expected: u32,
    received: u32,
    scope_id: Option<String>,
    started_at: Instant,
    timeout: CancellationToken,
    on_complete: CompletionCallback,
}

struct Link {
    parent: OperationId,
    counted: bool,
}

/// What arrived for an id before it was tracked or linked.
#[derive(Debug, Default)]
struct Early {
    completions: u32,
    failure: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    pending: HashMap<OperationId, PendingOperation>,
    links: HashMap<OperationId, Link>,
    unclaimed: HashMap<OperationId, Early>,
    unclaimed_order: VecDeque<OperationId>,
}

type Resolved = (PendingOperation, OperationOutcome);

impl TrackerState {
    fn early(&mut self, id: &str) -> &mut Early {
        if !self.unclaimed.contains_key(id) {
            self.unclaimed_order.push_back(id.to_string());
            while self.unclaimed_order.len() > UNCLAIMED_CAPACITY {
                if let Some(oldest) = self.unclaimed_order.pop_front() {
                    self.unclaimed.remove(&oldest);
                }
            }
        }
        self.unclaimed.entry(id.to_string()).or_default()
    }

    fn claim(&mut self, id: &str) -> Option<Early> {
        let early = self.unclaimed.remove(id)?;
        self.unclaimed_order.retain(|queued| queued != id);
        Some(early)
    }

    /// Applies early events to `parent`: up to `max_completions` of the
    /// buffered completions, then a buffered failure.
    fn replay(&mut self, parent: &str, early: Early, max_completions: u32) -> Option<Resolved> {
        for _ in 0..early.completions.min(max_completions) {
            if let Err(done) = self.count(parent) {
                return Some((done, OperationOutcome::Completed));
            }
        }
        let reason = early.failure?;
        let op = self.finish(parent)?;
        let outcome = OperationOutcome::Failed {
            reason,
            received: op.received,
            expected: op.expected,
        };
        Some((op, outcome))
    }

    /// Removes a resolved operation together with every link pointing at it.
    fn finish(&mut self, id: &str) -> Option<PendingOperation> {
        let op = self.pending.remove(id)?;
        op.timeout.cancel();
        self.links.retain(|_, link| link.parent != id);
        Some(op)
    }

    /// Counts one completion for `parent`. Returns the finished record when
    /// this was the last one expected.
    fn count(&mut self, parent: &str) -> Result<CompletionProgress, PendingOperation> {
        let Some(op) = self.pending.get_mut(parent) else {
            return Ok(CompletionProgress::Unclaimed);
        };
        op.received += 1;
        if op.received < op.expected {
            return Ok(CompletionProgress::Counted {
                received: op.received,
                expected: op.expected,
            });
        }
        match self.finish(parent) {
            Some(done) => Err(done),
            None => Ok(CompletionProgress::Unclaimed),
        }
    }
}

/// # Operation Tracker
///
/// Cheap to clone; all clones share the same records.
#[derive(Clone)]
pub struct OperationTracker {
    state: Arc<Mutex<TrackerState>>,
    /// Runtime current at construction, used for timeouts armed off-runtime.
    runtime: Option<Handle>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            runtime: Handle::try_current().ok(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// # Begin Operation
    ///
    /// Starts tracking a fresh operation that expects `expected` completion
    /// events within `timeout`. The returned id is what the server must echo
    /// (or what sub-operations get linked to).
    pub fn begin_operation<F>(&self, expected: u32, timeout: Duration, on_complete: F) -> OperationId
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.track(id.clone(), None, expected, timeout, Box::new(on_complete));
        id
    }

    /// Like [`begin_operation`](Self::begin_operation) but owned by a scope;
    /// [`discard_scope`](Self::discard_scope) drops it silently.
    pub fn begin_scoped_operation<F>(&self, scope_id: &str, expected: u32, timeout: Duration, on_complete: F) -> OperationId
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.track(id.clone(), Some(scope_id.to_string()), expected, timeout, Box::new(on_complete));
        id
    }

    /// Tracks an id the server already handed out (e.g. from a
    /// `MutationResponse`). Completions for it that arrived before this call
    /// count immediately.
    pub fn track_operation<F>(&self, operation_id: &str, scope_id: Option<&str>, expected: u32, timeout: Duration, on_complete: F)
    where
        F: FnOnce(OperationOutcome) + Send + 'static,
    {
        self.track(
            operation_id.to_string(),
            scope_id.map(str::to_string),
            expected,
            timeout,
            Box::new(on_complete),
        );
    }

    fn track(&self, id: OperationId, scope_id: Option<String>, expected: u32, timeout: Duration, on_complete: CompletionCallback) {
        if expected == 0 {
            tracing::debug!("Operation {} expects no events; completing immediately", id);
            on_complete(OperationOutcome::Completed);
            return;
        }

        let token = CancellationToken::new();
        let finished = {
            let mut state = self.lock();
            if let Some(previous) = state.finish(&id) {
                tracing::warn!("Operation {} restarted; previous record dropped", id);
                drop(previous);
            }
            state.pending.insert(
                id.clone(),
                PendingOperation {
                    expected,
                    received: 0,
                    scope_id,
                    started_at: Instant::now(),
                    timeout: token.clone(),
                    on_complete,
                },
            );
            state.claim(&id).and_then(|early| state.replay(&id, early, u32::MAX))
        };
        if let Some((done, outcome)) = finished {
            Self::resolve(&id, done, outcome);
            return;
        }

        tracing::debug!("Tracking operation {} (expects {}, timeout {:?})", id, expected, timeout);
        self.arm_timeout(id, token, timeout);
    }

    fn arm_timeout(&self, id: OperationId, token: CancellationToken, timeout: Duration) {
        let tracker = self.clone();
        match Handle::try_current().ok().or_else(|| self.runtime.clone()) {
            Some(runtime) => {
                runtime.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(timeout) => tracker.expire(&id),
                    }
                });
            }
            None => {
                // No runtime to schedule on: wait on a plain thread instead.
                let spawned = std::thread::Builder::new()
                    .name("operation-timeout".to_string())
                    .spawn(move || {
                        std::thread::sleep(timeout);
                        if !token.is_cancelled() {
                            tracker.expire(&id);
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!("Could not arm operation timeout: {}", e);
                }
            }
        }
    }

    /// # Link
    ///
    /// Maps a sub-operation id onto a live parent. If the sub id already
    /// completed before the link, it counts right away.
    pub fn link(&self, sub_id: &str, parent_id: &str) -> bool {
        let finished = {
            let mut state = self.lock();
            if !state.pending.contains_key(parent_id) {
                return false;
            }
            let early = state.claim(sub_id);
            state.links.insert(
                sub_id.to_string(),
                Link {
                    parent: parent_id.to_string(),
                    counted: early.as_ref().is_some_and(|e| e.completions > 0),
                },
            );
            // A linked id counts toward its parent once.
            early.and_then(|early| state.replay(parent_id, early, 1))
        };
        if let Some((done, outcome)) = finished {
            Self::resolve(parent_id, done, outcome);
        }
        true
    }

    /// # Register Completion
    ///
    /// Counts one completion event for `operation_id` (or for the parent it
    /// is linked to).
    pub fn register_completion(&self, operation_id: &str) -> CompletionProgress {
        let (parent, result) = {
            let mut state = self.lock();
            let parent = match state.links.get_mut(operation_id) {
                Some(link) if link.counted => return CompletionProgress::Duplicate,
                Some(link) => {
                    link.counted = true;
                    link.parent.clone()
                }
                None => operation_id.to_string(),
            };
            let result = state.count(&parent);
            if matches!(result, Ok(CompletionProgress::Unclaimed)) {
                state.early(operation_id).completions += 1;
            }
            (parent, result)
        };
        match result {
            Ok(progress) => progress,
            Err(done) => {
                Self::resolve(&parent, done, OperationOutcome::Completed);
                CompletionProgress::Completed
            }
        }
    }

    /// Resolves the operation (or its parent) as failed. Returns whether a
    /// live operation was found; otherwise the failure is kept for a later
    /// `link` or `track_operation` of the same id.
    pub fn fail(&self, operation_id: &str, reason: &str) -> bool {
        let (parent, done) = {
            let mut state = self.lock();
            let linked = state.links.get(operation_id).map(|link| link.parent.clone());
            let parent = linked.clone().unwrap_or_else(|| operation_id.to_string());
            let done = state.finish(&parent);
            if done.is_none() && linked.is_none() {
                state.early(operation_id).failure.get_or_insert_with(|| reason.to_string());
            }
            (parent, done)
        };
        match done {
            Some(op) => {
                let outcome = OperationOutcome::Failed {
                    reason: reason.to_string(),
                    received: op.received,
                    expected: op.expected,
                };
                Self::resolve(&parent, op, outcome);
                true
            }
            None => false,
        }
    }

    fn expire(&self, operation_id: &str) {
        let done = self.lock().finish(operation_id);
        if let Some(op) = done {
            let outcome = OperationOutcome::TimedOut {
                received: op.received,
                expected: op.expected,
            };
            Self::resolve(operation_id, op, outcome);
        }
    }

    /// Runs the callback with no lock held, so it may begin new operations.
    fn resolve(id: &str, op: PendingOperation, outcome: OperationOutcome) {
        let elapsed = op.started_at.elapsed();
        match &outcome {
            OperationOutcome::Completed => {
                tracing::info!("Operation {} completed in {:?}", id, elapsed)
            }
            other => tracing::warn!("Operation {} {} ({:?})", id, other, elapsed),
        }
        (op.on_complete)(outcome);
    }

    /// # Discard Scope
    ///
    /// Drops every operation owned by `scope_id` without invoking callbacks.
    pub fn discard_scope(&self, scope_id: &str) -> usize {
        let mut state = self.lock();
        let owned: Vec<OperationId> = state
            .pending
            .iter()
            .filter(|(_, op)| op.scope_id.as_deref() == Some(scope_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            state.finish(id);
        }
        if !owned.is_empty() {
            tracing::info!("Discarded {} operations of scope {}", owned.len(), scope_id);
        }
        owned.len()
    }

    /// Number of operations still waiting.
    pub fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, operation_id: &str) -> bool {
        self.lock().pending.contains_key(operation_id)
    }

    /// # Attach
    ///
    /// Subscribes the tracker to every completion and failure kind. Events
    /// without an operation id are left to the cache.
    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<Subscription> {
        self.subscribe_kinds(dispatcher, None)
    }

    /// Like [`attach`](Self::attach) but only counts events of one scope.
    /// Subscribe after the scope's cache handlers so an outcome callback
    /// already sees the cache state of the event that resolved it.
    pub fn attach_scope(&self, dispatcher: &Dispatcher, scope_id: &str) -> Vec<Subscription> {
        self.subscribe_kinds(dispatcher, Some(scope_id.to_string()))
    }

    fn subscribe_kinds(&self, dispatcher: &Dispatcher, scope: Option<String>) -> Vec<Subscription> {
        EventKind::ALL
            .iter()
            .filter(|kind| kind.is_completion() || kind.is_failure())
            .map(|kind| {
                let tracker = self.clone();
                let scope = scope.clone();
                dispatcher.subscribe(*kind, move |event| {
                    if scope.as_ref().map_or(true, |s| *s == event.scope_id) {
                        tracker.on_event(event);
                    }
                    Ok(())
                })
            })
            .collect()
    }

    fn on_event(&self, event: &SyncEvent) {
        let Some(operation_id) = event.operation_id.as_deref() else {
            return;
        };
        if event.kind.is_failure() {
            let reason = event
                .payload
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or(event.kind.as_str());
            self.fail(operation_id, reason);
        } else {
            let progress = self.register_completion(operation_id);
            tracing::debug!("{} for {}: {:?}", event.kind, operation_id, progress);
        }
    }
}
