//! Shared plumbing for the sync binaries: configuration, logging and the
//! snapshot source that answers refetch requests.

pub mod client_logic;
