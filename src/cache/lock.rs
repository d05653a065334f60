//! Poison-tolerant lock access for the in-process cache structures.
//!
//! A panic while a cache lock is held must not take the cache down with it:
//! the guard is recovered and a warning is emitted instead.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recovered<G>(poisoned: PoisonError<G>, kind: &'static str, op: &'static str) -> G {
    warn!(
        op,
        lock_kind = kind,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock; state may be stale"
    );
    poisoned.into_inner()
}

pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self, op: &'static str) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self, op: &'static str) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_or_recover(&self, op: &'static str) -> RwLockReadGuard<'_, T> {
        self.read()
            .unwrap_or_else(|poisoned| recovered(poisoned, "rwlock.read", op))
    }

    fn write_or_recover(&self, op: &'static str) -> RwLockWriteGuard<'_, T> {
        self.write()
            .unwrap_or_else(|poisoned| recovered(poisoned, "rwlock.write", op))
    }
}

pub(crate) trait MutexExt<T> {
    fn lock_or_recover(&self, op: &'static str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self, op: &'static str) -> MutexGuard<'_, T> {
        self.lock()
            .unwrap_or_else(|poisoned| recovered(poisoned, "mutex.lock", op))
    }
}
