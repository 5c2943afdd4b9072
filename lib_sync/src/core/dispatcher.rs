//! # In-Process Event Dispatcher
//!
//! The `Dispatcher` decouples whoever produces [`SyncEvent`]s (the connection
//! manager, tests, a host replaying a snapshot) from whoever consumes them
//! (the cache layer, the operation tracker). It carries no business logic.
//!
//! ## Core Design Principles:
//!
//! 1.  **Synchronous Fan-out**: `emit` invokes every handler registered for
//!     the event's kind, in registration order, before returning. There is no
//!     queue, no rescheduling and no debouncing. A handler only causes another
//!     handler to run by calling `emit` itself.
//!
//! 2.  **Handler Isolation**: A handler that returns `Err` or panics is logged
//!     and skipped; its siblings still run and the dispatcher stays usable.
//!
//! 3.  **Snapshot Iteration**: The handler list is cloned (cheap `Arc` clones)
//!     before any handler runs and the registry lock is released, so handlers
//!     may subscribe, unsubscribe or emit without deadlocking.
//!
//! 4.  **Identity-based Removal**: Every registration gets a unique id.
//!     Unsubscribing removes exactly that id, so a stale or repeated
//!     unsubscribe can never take out a handler registered later.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::core::event::{EventKind, SyncEvent};

/// What a handler reports back. Errors are logged by the dispatcher, nothing more.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&SyncEvent) -> HandlerResult + Send + Sync>;

/// # Handler Entry
///
/// A registered handler together with the id used to remove it.
#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<EventKind, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<HandlerEntry>>> {
        // A panicking handler never runs under this lock, so poisoning only
        // happens on a bug in this module; keep serving rather than cascade.
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }
}

/// # Core Dispatcher
///
/// Cloning a `Dispatcher` yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Subscribe
    ///
    /// Registers `handler` under `kind` and returns the [`Subscription`] that
    /// removes it. Dropping the subscription unsubscribes as well, so keep it
    /// alive for as long as the handler should run.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .entry(kind)
            .or_default()
            .push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });
        tracing::trace!("Handler {} subscribed to {}", id, kind);

        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
        }
    }

    /// # Emit
    ///
    /// Builds a [`SyncEvent`] stamped with the current time and fans it out.
    pub fn emit(&self, kind: EventKind, scope_id: &str, payload: Value, operation_id: Option<&str>) {
        let mut event = SyncEvent::new(kind, scope_id, payload);
        event.operation_id = operation_id.map(str::to_string);
        self.emit_event(&event);
    }

    /// # Emit Event
    ///
    /// Fans `event` out to a snapshot of the handlers registered for its kind.
    /// Returns the number of handlers that completed without error.
    pub fn emit_event(&self, event: &SyncEvent) -> usize {
        let snapshot: Vec<HandlerEntry> = match self.registry.lock().get(&event.kind) {
            Some(list) => list.clone(),
            None => {
                tracing::trace!("No handlers for {} (scope {})", event.kind, event.scope_id);
                return 0;
            }
        };

        let mut delivered = 0;
        for entry in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Handler {} failed on {} (scope {}): {}",
                        entry.id,
                        event.kind,
                        event.scope_id,
                        e
                    );
                }
                Err(panic_payload) => {
                    let reason = panic_payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    tracing::error!(
                        "Handler {} panicked on {} (scope {}): {}",
                        entry.id,
                        event.kind,
                        event.scope_id,
                        reason
                    );
                }
            }
        }
        delivered
    }

    /// Number of handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.lock().get(&kind).map_or(0, Vec::len)
    }
}

/// # Subscription
///
/// Handle for one registration. `unsubscribe` is idempotent and safe to call
/// from inside the handler it removes.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<Registry>,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.kind, self.id) {
                tracing::trace!("Handler {} unsubscribed from {}", self.id, self.kind);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}
