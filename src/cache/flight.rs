use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Per-key gate coalescing concurrent read-through loads.
///
/// The first caller for a key becomes the leader; later callers wait on the
/// same slot and re-check the cache once the leader releases it.
#[derive(Default, Clone)]
pub(crate) struct InFlightLoads {
    slots: Slots,
}

impl InFlightLoads {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, key: &str) -> LoadGuard {
        let slot = SlotRef {
            key: key.to_string(),
            slots: Arc::clone(&self.slots),
            mutex: Some(Arc::clone(
                self.slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value(),
            )),
        };
        // A waiter cancelled here still drops `slot`, which cleans up.
        let guard = slot.lock().await;
        LoadGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.slots.len()
    }
}

/// One caller's hold on a slot, from before it starts waiting.
struct SlotRef {
    key: String,
    slots: Slots,
    mutex: Option<Arc<Mutex<()>>>,
}

impl SlotRef {
    async fn lock(&self) -> Option<OwnedMutexGuard<()>> {
        let mutex = Arc::clone(self.mutex.as_ref()?);
        Some(mutex.lock_owned().await)
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        // Release our reference before the count check.
        drop(self.mutex.take());
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Held by the leader for the duration of a load. Fields drop in order: the
/// lock is released before the slot is considered for removal.
pub(crate) struct LoadGuard {
    _guard: Option<OwnedMutexGuard<()>>,
    _slot: SlotRef,
}
