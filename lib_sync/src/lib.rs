//! # lib_sync
//!
//! Client-side state synchronization for the course authoring platform.
//! A single push connection feeds server-confirmed events through an
//! in-process dispatcher into a normalized entity cache, while compound
//! user actions are tracked to a single completion signal.
//!
//! Start with [`core::engine`] for the wired-up facade, or use the
//! components from [`core`] directly.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Configuration for the engine and its transport.
pub mod configs;
/// The synchronization engine components.
pub mod core;
/// Library-wide error type.
pub mod error;

// Re-export the most used entry points.
pub use configs::sync_config::{ConfigError, SyncConfig};
pub use error::SyncError;
