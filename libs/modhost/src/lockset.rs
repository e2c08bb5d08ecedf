//! Keyed reentrant try-locks.
//!
//! Serializes install/update operations that race on the same location or
//! symbolic name without blocking unrelated operations. Entries are created
//! on demand and removed once no holder or waiter remains.

use std::collections::HashMap;
use std::hash::Hash;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Entry {
    owner: Option<ThreadId>,
    depth: usize,
    waiters: usize,
}

/// A registry of named reentrant locks.
pub struct LockSet<K: Eq + Hash + Clone> {
    entries: Mutex<HashMap<K, Entry>>,
    freed: Condvar,
}

impl<K: Eq + Hash + Clone> Default for LockSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LockSet<K> {
    #[must_use]
    pub fn new() -> Self {
        LockSet {
            entries: Mutex::new(HashMap::new()),
            freed: Condvar::new(),
        }
    }

    /// Acquire the lock for `key`, waiting up to `timeout`. Returns a guard
    /// that releases on drop, or `None` when the wait timed out. Reentrant
    /// for the owning thread.
    pub fn lock(&self, key: K, timeout: Duration) -> Option<KeyGuard<'_, K>> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            let entry = entries.entry(key.clone()).or_insert(Entry {
                owner: None,
                depth: 0,
                waiters: 0,
            });
            match entry.owner {
                None => {
                    entry.owner = Some(me);
                    entry.depth = 1;
                    return Some(KeyGuard { set: self, key });
                }
                Some(owner) if owner == me => {
                    entry.depth += 1;
                    return Some(KeyGuard { set: self, key });
                }
                Some(_) => {
                    entry.waiters += 1;
                    let timed_out = self.freed.wait_until(&mut entries, deadline).timed_out();
                    let entry = entries
                        .get_mut(&key)
                        .expect("lock entry is pinned while it has waiters");
                    entry.waiters -= 1;
                    if timed_out {
                        if entry.owner.is_none() && entry.waiters == 0 {
                            entries.remove(&key);
                        }
                        return None;
                    }
                }
            }
        }
    }

    fn unlock(&self, key: &K) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug_assert!(false, "unlock of a key that is not held");
            return;
        };
        debug_assert_eq!(entry.owner, Some(thread::current().id()));
        entry.depth -= 1;
        if entry.depth == 0 {
            entry.owner = None;
            if entry.waiters == 0 {
                entries.remove(key);
            } else {
                self.freed.notify_all();
            }
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// RAII release for a key acquired from a [`LockSet`].
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    set: &'a LockSet<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.set.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn lock_is_reentrant_for_the_same_thread() {
        let set = LockSet::new();
        let outer = set.lock("a".to_owned(), SHORT).unwrap();
        let inner = set.lock("a".to_owned(), SHORT).unwrap();
        drop(inner);
        drop(outer);
        assert!(set.is_empty());
    }

    #[test]
    fn unrelated_keys_do_not_contend() {
        let set = LockSet::new();
        let _a = set.lock("a".to_owned(), SHORT).unwrap();
        let _b = set.lock("b".to_owned(), SHORT).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let set = Arc::new(LockSet::new());
        let guard = set.lock("a".to_owned(), SHORT).unwrap();
        let set2 = Arc::clone(&set);
        let waiter = thread::spawn(move || set2.lock("a".to_owned(), SHORT).is_none());
        assert!(waiter.join().unwrap());
        drop(guard);
        assert!(set.is_empty());
    }

    #[test]
    fn waiter_acquires_after_release() {
        let set = Arc::new(LockSet::new());
        let guard = set.lock("a".to_owned(), SHORT).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));
        let set2 = Arc::clone(&set);
        let acquired2 = Arc::clone(&acquired);
        let waiter = thread::spawn(move || {
            let g = set2.lock("a".to_owned(), Duration::from_secs(5));
            acquired2.store(g.is_some(), Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(set.is_empty());
    }
}
