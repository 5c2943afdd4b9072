//! # Core Engine Module
//!
//! The components of the synchronization engine, each depending only on the
//! ones listed before it:
//!
//! - **`event`** / **`dispatcher`**: the closed event vocabulary and the
//!   synchronous in-process pub/sub that fans events out.
//! - **`transport`** / **`backoff`** / **`connection_manager`**: the single
//!   push connection, kept alive with jittered exponential backoff, parsing
//!   frames and republishing them on the dispatcher.
//! - **`operation_tracker`**: N expected completion events in, one outcome out.
//! - **`model`** / **`cache`**: flat id-keyed entity maps, the only writer of
//!   entity state.
//! - **`upload_progress`**: the debounced side path for progress frames.
//! - **`registry`** / **`engine`**: scope reference counting with linger, and
//!   the facade that wires everything into one process-wide engine.

pub mod backoff;
pub mod cache;
pub mod connection_manager;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod model;
pub mod operation_tracker;
pub mod registry;
pub mod transport;
pub mod upload_progress;

// --- Public API Re-exports ---
pub use cache::{ApplyOutcome, NormalizedCache, RefetchRequest};
pub use connection_manager::{ConnectionManager, ConnectionStatus};
pub use dispatcher::{Dispatcher, HandlerResult, Subscription};
pub use engine::{MutationResponse, ScopeHandle, SyncEngine};
pub use event::{EventKind, Frame, FrameError, SyncEvent};
pub use model::{Chapter, Collection, Course, CourseSnapshot, Entity, Slot, Video, VideoStatus};
pub use operation_tracker::{OperationId, OperationOutcome, OperationTracker};
pub use registry::Registry;
pub use transport::{Connector, Inbound, InboundStream, TransportError};
#[cfg(feature = "ws")]
pub use transport::WsConnector;
pub use upload_progress::UploadProgressStream;
