//! Per-key exclusive sections
//!
//! Everything that read-modify-writes a user's session (inbound events, job
//! settlement) holds that user's lock. Different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::OwnedMutexGuard;

/// Map size above which dead entries are swept on the next acquire
const PRUNE_THRESHOLD: usize = 256;

#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        if slots.len() > PRUNE_THRESHOLD {
            slots.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let slot = Arc::new(tokio::sync::Mutex::new(()));
        slots.insert(key.to_string(), Arc::downgrade(&slot));
        slot
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
