use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Keyed mutex serializing the handling of messages on the same thread.
/// Messages on different threads never wait for each other.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Held while a message of `thread_id` is being handled
pub struct ThreadGuard {
    thread_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

/// The map only holds `Arc`s, a panic while it was locked leaves it intact
fn map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ThreadLocks {
    pub async fn lock(&self, thread_id: &str) -> ThreadGuard {
        let lock = map(&self.locks).entry(thread_id.to_string()).or_default().clone();

        let guard = lock.clone().lock_owned().await;

        ThreadGuard {
            thread_id: thread_id.to_string(),
            lock,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of threads currently locked or waited on
    pub fn len(&self) -> usize {
        map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = map(&self.locks);
        // only the map and this guard still reference the lock
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.thread_id);
        }
    }
}
