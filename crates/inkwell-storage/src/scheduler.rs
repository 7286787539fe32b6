//! Save coalescing and debounced auto-save timers
//!
//! [`SaveCoalescer`] admits at most one save per document at a time. A
//! background or manual request that finds a save in flight is coalesced: it
//! sets a re-run flag and returns immediately, and the in-flight saver makes
//! one more pass when it releases. Shutdown requests wait their turn instead.
//!
//! [`DebounceTimers`] owns one cancellable timer per document; scheduling
//! again replaces a timer that has not fired yet.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::trace;

/// Who is asking for a save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SavePriority {
    /// Debounced background save
    AutoSave,
    /// Explicit user request
    Manual,
    /// Final save during close or shutdown; waits for an in-flight save
    Shutdown,
}

impl SavePriority {
    /// Whether this request waits for an in-flight save instead of coalescing
    pub fn waits(&self) -> bool {
        matches!(self, SavePriority::Shutdown)
    }
}

#[derive(Debug, Default)]
struct SaveSlot {
    gate: Arc<Mutex<()>>,
    rerun: AtomicBool,
}

/// Exclusive right to write one document
#[derive(Debug)]
pub struct SavePermit {
    _guard: OwnedMutexGuard<()>,
    slot: Arc<SaveSlot>,
}

impl SavePermit {
    /// Give up the permit; returns whether a request was coalesced meanwhile
    pub fn release(self) -> bool {
        let slot = self.slot.clone();
        drop(self);
        slot.rerun.swap(false, Ordering::SeqCst)
    }
}

/// Result of asking the coalescer for a save
#[derive(Debug)]
pub enum Admission {
    /// Caller may write
    Acquired(SavePermit),
    /// A save is in flight; it will make another pass
    Coalesced,
}

/// Per-document single-flight gate for saves
#[derive(Debug, Default)]
pub struct SaveCoalescer {
    slots: DashMap<String, Arc<SaveSlot>>,
}

impl SaveCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Arc<SaveSlot> {
        self.slots.entry(id.to_string()).or_default().value().clone()
    }

    /// Request permission to save `id`
    pub async fn admit(&self, id: &str, priority: SavePriority) -> Admission {
        let slot = self.slot(id);
        if priority.waits() {
            let guard = slot.gate.clone().lock_owned().await;
            return Admission::Acquired(SavePermit {
                _guard: guard,
                slot,
            });
        }

        match slot.gate.clone().try_lock_owned() {
            Ok(guard) => Admission::Acquired(SavePermit {
                _guard: guard,
                slot,
            }),
            Err(_) => {
                slot.rerun.store(true, Ordering::SeqCst);
                trace!(document_id = id, ?priority, "Save coalesced");
                Admission::Coalesced
            }
        }
    }

    /// Whether a save for `id` holds the gate right now
    pub fn is_saving(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.gate.try_lock().is_err())
    }

    /// Drop the slot for a closed document unless a save still holds it
    pub fn forget(&self, id: &str) {
        self.slots
            .remove_if(id, |_, slot| Arc::strong_count(&slot.gate) == 1);
    }
}

struct TimerSlot {
    generation: u64,
    handle: AbortHandle,
}

/// One cancellable, re-armable timer per document
#[derive(Debug)]
pub struct DebounceTimers {
    timers: Arc<DashMap<String, TimerSlot>>,
    generation: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TimerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSlot")
            .field("generation", &self.generation)
            .finish()
    }
}

impl Default for DebounceTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl DebounceTimers {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Run `task` after `delay` unless `id` is scheduled again first
    ///
    /// A timer that already fired is left to finish. No-op after
    /// [`cancel_all`](Self::cancel_all).
    pub fn schedule<F>(&self, id: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let timers = self.timers.clone();
        let cancel = self.cancel.clone();
        let key = id.to_string();

        // Hold the entry so the new timer cannot wake before it is registered
        let entry = self.timers.entry(id.to_string());
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
                // Replaced while waking up
                if timers
                    .remove_if(&key, |_, slot| slot.generation == generation)
                    .is_none()
                {
                    return;
                }
                task.await;
            }
            .with_current_subscriber(),
        );

        let slot = TimerSlot {
            generation,
            handle: handle.abort_handle(),
        };
        match entry {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(slot);
                previous.handle.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }
    }

    /// Cancel the pending timer for `id`
    pub fn cancel(&self, id: &str) -> bool {
        match self.timers.remove(id) {
            Some((_, slot)) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `id` has a timer that has not fired
    pub fn is_pending(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every timer and refuse new ones
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        for slot in self.timers.iter() {
            slot.handle.abort();
        }
        self.timers.clear();
    }
}
