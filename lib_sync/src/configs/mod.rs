//! # Configuration Modules
//!
//! Tunables for the engine. Nothing in here is protocol contract: backoff
//! bounds and operation timeouts are deployment choices.

/// Engine and transport settings with defaults and JSON file loading.
pub mod sync_config;
