//! Library-wide error type.
//!
//! Transport and frame errors are recovered inside the connection manager and
//! never reach callers; what remains here is what a host can actually observe.

use thiserror::Error;

use crate::configs::sync_config::ConfigError;
use crate::core::event::FrameError;
use crate::core::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Engine is already initialized")]
    AlreadyInitialized,

    #[error("Malformed payload for {kind}: {reason}")]
    Payload { kind: &'static str, reason: String },
}
