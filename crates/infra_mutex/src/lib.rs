//! Named async locks used to serialize projection updates, decision cycles and response handling.
//!
//! Waiters are woken in FIFO order (`tokio::sync::Mutex` is fair). Every named lock tracks how
//! many parties are pending on it (the holder plus queued waiters) so that a caller can wait for
//! the queue to drain without taking the lock itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

/// Serializes every mutation of the state projection.
pub const STATE_LOCK: &str = "state";
/// Serializes the snapshot-simulate-decide-submit critical section.
pub const DECISION_LOCK: &str = "estimate";
/// Serializes handling of finalized responses.
pub const RESPONSE_LOCK: &str = "resp";

static NEXT_SERIALIZER_ID: AtomicU64 = AtomicU64::new(1);

struct NamedLock {
    gate: Arc<AsyncMutex<()>>,
    pending: AtomicUsize,
    holder: Mutex<Option<u64>>,
    changed: Notify,
}

impl NamedLock {
    fn new() -> Self {
        Self {
            gate: Arc::new(AsyncMutex::new(())),
            pending: AtomicUsize::new(0),
            holder: Mutex::new(None),
            changed: Notify::new(),
        }
    }
}

/// Counts one pending party for as long as it lives. Dropping an acquire future mid-wait drops
/// its slot, so cancelled waiters never leave the queue looking busy.
struct PendingSlot {
    lock: Arc<NamedLock>,
}

impl PendingSlot {
    fn enter(lock: Arc<NamedLock>) -> Self {
        lock.pending.fetch_add(1, Ordering::AcqRel);
        Self { lock }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.lock.pending.fetch_sub(1, Ordering::AcqRel);
        self.lock.changed.notify_waiters();
    }
}

pub struct Serializer {
    id: u64,
    locks: Mutex<HashMap<String, Arc<NamedLock>>>,
    next_token: AtomicU64,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("id", &self.id)
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            id: NEXT_SERIALIZER_ID.fetch_add(1, Ordering::Relaxed),
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn entry(&self, name: &str) -> Arc<NamedLock> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NamedLock::new()))
            .clone()
    }

    /// Suspends until `name` is free, then returns the token that releases it.
    pub async fn acquire(&self, name: &str) -> LockToken {
        let lock = self.entry(name);
        let slot = PendingSlot::enter(lock.clone());
        let guard = lock.gate.clone().lock_owned().await;
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        *lock.holder.lock() = Some(id);
        tracing::trace!(lock = name, token = id, "lock acquired");
        LockToken {
            name: name.to_string(),
            id,
            owner: self.id,
            lock,
            guard: Some(guard),
            slot: Some(slot),
        }
    }

    /// Releases `token`, panicking if it was not issued by this serializer or if the named lock
    /// is not held by it. Both indicate a broken lock discipline.
    pub fn release(&self, token: LockToken) {
        if token.owner != self.id {
            panic!(
                "lock {} released on a serializer that did not issue it",
                token.name
            );
        }
        let holder = *token.lock.holder.lock();
        if holder != Some(token.id) {
            panic!(
                "release of lock {} which is not held by token {}",
                token.name, token.id
            );
        }
        token.release();
    }

    /// Waits until nobody holds or waits for `name` at the moment of a check.
    ///
    /// Must not be called while holding `name`.
    pub async fn drain_queue(&self, name: &str) {
        let lock = self.entry(name);
        loop {
            let notified = lock.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Holder plus queued waiters.
    pub fn pending(&self, name: &str) -> usize {
        self.entry(name).pending.load(Ordering::Acquire)
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.entry(name).holder.lock().is_some()
    }
}

/// Proof of holding a named lock. Released exactly once, by `release` or on drop.
pub struct LockToken {
    name: String,
    id: u64,
    owner: u64,
    lock: Arc<NamedLock>,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Option<PendingSlot>,
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        *self.lock.holder.lock() = None;
        drop(guard);
        drop(self.slot.take());
        tracing::trace!(lock = %self.name, token = self.id, "lock released");
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}
