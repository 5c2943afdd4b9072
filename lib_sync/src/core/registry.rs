//! # Scope Registry
//!
//! Reference counts per key with a linger period. When the last holder of a
//! key releases it, an expiry callback is scheduled `linger` later; acquiring
//! the key again before then cancels it. This keeps a course that the UI
//! closes and immediately reopens (route changes, remounts) from being torn
//! down and rebuilt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Result of [`Registry::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// First holder; nothing existed for this key.
    Fresh,
    /// First holder again, while the key was still lingering.
    Revived,
    /// Another holder already had it.
    Shared,
}

struct Lease {
    holders: u32,
    linger: CancellationToken,
}

#[derive(Clone)]
pub struct Registry {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    linger: Duration,
}

impl Registry {
    pub fn new(linger: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            linger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn acquire(&self, key: &str) -> Acquired {
        let mut leases = self.lock();
        match leases.get_mut(key) {
            Some(lease) => {
                lease.holders += 1;
                if lease.holders == 1 {
                    // It was lingering: stop the expiry and arm a fresh token.
                    lease.linger.cancel();
                    lease.linger = CancellationToken::new();
                    tracing::debug!("Linger cancelled for {}", key);
                    Acquired::Revived
                } else {
                    Acquired::Shared
                }
            }
            None => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        holders: 1,
                        linger: CancellationToken::new(),
                    },
                );
                Acquired::Fresh
            }
        }
    }

    /// Drops one holder. Returns `true` when this was the last one, in which
    /// case `on_expire` runs after the linger period unless the key is
    /// acquired again first. Without a Tokio runtime it runs immediately.
    pub fn release<F>(&self, key: &str, on_expire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let token = {
            let mut leases = self.lock();
            let Some(lease) = leases.get_mut(key) else {
                return false;
            };
            if lease.holders == 0 {
                return false;
            }
            lease.holders -= 1;
            if lease.holders > 0 {
                return false;
            }
            lease.linger.clone()
        };

        let registry = self.clone();
        let key = key.to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if registry.expire(&key) {
                on_expire();
            }
            return true;
        };
        let linger = self.linger;
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = sleep(linger) => {
                    if registry.expire(&key) {
                        tracing::info!("Linger expired for {}", key);
                        on_expire();
                    }
                }
            }
        });
        true
    }

    /// Removes the key if nobody re-acquired it meanwhile.
    fn expire(&self, key: &str) -> bool {
        let mut leases = self.lock();
        match leases.get(key) {
            Some(lease) if lease.holders == 0 => {
                leases.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Forgets every key, lingering ones included, and cancels their pending
    /// expiry. Returns the keys that were registered.
    pub fn drain(&self) -> Vec<String> {
        let mut leases = self.lock();
        leases
            .drain()
            .map(|(key, lease)| {
                lease.linger.cancel();
                key
            })
            .collect()
    }

    pub fn holders(&self, key: &str) -> u32 {
        self.lock().get(key).map_or(0, |lease| lease.holders)
    }

    /// Keys still registered, lingering ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
