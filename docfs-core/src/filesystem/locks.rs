use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Held while a content read-modify-write runs on one path.
pub type PathGuard = ArcMutexGuard<RawMutex, ()>;

/// One mutex per overlay path, created on first use.
#[derive(Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `path` is free. The lock is released when the guard drops.
    pub fn lock(&self, path: &str) -> PathGuard {
        let lock = {
            let mut locks = self.locks.lock();
            // forget paths nobody holds
            locks.retain(|key, lock| key == path || Arc::strong_count(lock) > 1);
            locks.entry(path.to_string()).or_default().clone()
        };
        lock.lock_arc()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
