use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::stream::CancelFlag;

/// Identity of a long-running operation: who asked, and for what target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub account_id: String,
    pub target: String,
}

impl OperationKey {
    pub fn new(account_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self { account_id: account_id.into(), target: target.into() }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.account_id, self.target)
    }
}

/// A live entry in the registry.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: u64,
    key: OperationKey,
    flag: CancelFlag,
}

impl OperationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.flag.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

/// Single-flight table of long-running operations.
///
/// The lock is only held for the map mutation itself and never across an
/// await point, so it is safe to call from the control path.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<OperationKey, OperationHandle>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an operation under `key`, cancelling whatever was running there.
    ///
    /// `factory` runs while the table is locked and must not block; it is
    /// handed the new handle so it can wire the handle's cancel flag into the
    /// producer it builds.
    pub fn start<T>(&self, key: OperationKey, factory: impl FnOnce(&OperationHandle) -> T) -> (OperationHandle, T) {
        let mut live = self.lock();
        if let Some(previous) = live.remove(&key) {
            previous.flag.cancel();
            info!(operation = %key, previous_id = previous.id, "superseding running operation");
        }
        let handle = OperationHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            key: key.clone(),
            flag: CancelFlag::new(),
        };
        let out = factory(&handle);
        live.insert(key, handle.clone());
        (handle, out)
    }

    /// Cancel and forget the operation under `key`. Returns false when there
    /// was nothing to cancel.
    pub fn cancel(&self, key: &OperationKey) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.flag.cancel();
                info!(operation = %key, id = handle.id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `handle`, unless a newer operation replaced it.
    pub fn complete(&self, handle: &OperationHandle) -> bool {
        let mut live = self.lock();
        match live.get(&handle.key) {
            Some(current) if current.id == handle.id => {
                live.remove(&handle.key);
                debug!(operation = %handle.key, id = handle.id, "operation completed");
                true
            }
            _ => false,
        }
    }

    /// Cancel every live operation. Used on session teardown.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<OperationHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.flag.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "cancelled live operations");
        }
        drained.len()
    }

    #[cfg(test)]
    pub fn handle(&self, key: &OperationKey) -> Option<OperationHandle> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &OperationKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationKey, OperationHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(target: &str) -> OperationKey {
        OperationKey::new("acct", target)
    }

    #[test]
    fn start_supersedes_previous_operation() {
        let registry = OperationRegistry::new();
        let (first, _) = registry.start(key("app"), |_| ());
        let (second, _) = registry.start(key("app"), |_| ());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
        // The stale handle must not evict its replacement.
        assert!(!registry.complete(&first));
        assert!(registry.contains(&key("app")));
        assert!(registry.complete(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn every_start_gets_a_fresh_id() {
        let registry = OperationRegistry::new();
        let (first, _) = registry.start(key("app"), |_| ());
        let (second, _) = registry.start(key("app"), |_| ());
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.handle(&key("app")).map(|h| h.id()), Some(second.id()));
    }

    #[test]
    fn factory_receives_the_new_handle() {
        let registry = OperationRegistry::new();
        let (handle, flag) = registry.start(key("app"), |h| h.cancel_flag());
        registry.cancel(handle.key());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = OperationRegistry::new();
        registry.start(key("app"), |_| ());
        assert!(registry.cancel(&key("app")));
        assert!(!registry.cancel(&key("app")));
        assert!(!registry.cancel(&key("other")));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let registry = OperationRegistry::new();
        let (a, _) = registry.start(key("a"), |_| ());
        let (b, _) = registry.start(OperationKey::new("other", "a"), |_| ());
        assert!(!a.is_cancelled() && !b.is_cancelled());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_starts_leave_a_single_live_operation() {
        let registry = Arc::new(OperationRegistry::new());
        let handles: Vec<OperationHandle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let registry = registry.clone();
                    s.spawn(move || registry.start(key("app"), |_| ()).0)
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(registry.len(), 1);
        let live: Vec<_> = handles.iter().filter(|h| !h.is_cancelled()).collect();
        assert_eq!(live.len(), 1);
        assert!(registry.complete(live[0]));
    }

    #[test]
    fn key_display_joins_account_and_target() {
        assert_eq!(key("app").to_string(), "acct_app");
    }
}
