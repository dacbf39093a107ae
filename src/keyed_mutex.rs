use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    /// Holders plus waiters for this key. The entry is evicted when the
    /// count returns to zero; it is never reused across that crossing.
    count: usize,
    mutex: Arc<AsyncMutex<()>>,
}

/// Mutual exclusion keyed by name. A task holding a named lock blocks every
/// other task that asks for the same name; distinct names are independent.
///
/// The map itself is guarded by a plain mutex that is only held for
/// bookkeeping, never across the acquisition of a per-key lock. A racing
/// acquirer either observes an entry before eviction and bumps its count, or
/// creates a fresh one afterward.
pub struct KeyedMutex {
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        KeyedMutex {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Locks `name`, waiting until no other holder has it. The returned
    /// guard releases the lock on drop, so an unlock can neither be missed
    /// nor issued twice.
    pub async fn lock(&self, name: &str) -> KeyedGuard<'_> {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(name.to_owned()).or_insert_with(|| Entry {
                count: 0,
                mutex: Arc::new(AsyncMutex::new(())),
            });
            entry.count += 1;
            Arc::clone(&entry.mutex)
        };

        // If the caller is cancelled while waiting, the registration must
        // still be undone or the entry would never be evicted.
        let mut registration = Registration {
            owner: self,
            name,
            armed: true,
        };
        let guard = mutex.lock_owned().await;
        registration.armed = false;

        KeyedGuard {
            owner: self,
            name: name.to_owned(),
            _guard: guard,
        }
    }

    /// Number of live entries; returns to zero once every guard is dropped.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            panic!("unlock of key {:?} that is not locked", name);
        };
        entry.count -= 1;
        if entry.count == 0 {
            entries.remove(name);
        }
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

struct Registration<'a> {
    owner: &'a KeyedMutex,
    name: &'a str,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.owner.release(self.name);
        }
    }
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // Bookkeeping happens before the per-key mutex is released (when
        // `_guard` drops after this body), mirroring the eviction contract:
        // any waiter already counted keeps the entry alive.
        self.owner.release(&self.name);
    }
}
