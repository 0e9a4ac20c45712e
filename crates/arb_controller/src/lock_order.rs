//! Lock acquisition for one decision cycle:
//! state-queue drain, decision lock, cross-process lock, then a short state lock per snapshot.
//!
//! Each stage can only be reached from the previous one, and `CrossHeld` releases the
//! cross-process lock before the decision lock whether it is released explicitly or dropped on
//! an early return.

use std::sync::Arc;

use anyhow::Result;
use core_types::ProjectionSnapshot;
use infra_mutex::{LockToken, Serializer, DECISION_LOCK, STATE_LOCK};
use state_projection::StateProjection;
use watchdog_lock::{WatchdogGuard, WatchdogLock};

pub(crate) struct LockOrder<'a> {
    serializer: &'a Serializer,
    watchdog: &'a Arc<WatchdogLock>,
}

impl<'a> LockOrder<'a> {
    pub(crate) fn new(serializer: &'a Serializer, watchdog: &'a Arc<WatchdogLock>) -> Self {
        Self {
            serializer,
            watchdog,
        }
    }

    pub(crate) async fn drain_state(self) -> Drained<'a> {
        self.serializer.drain_queue(STATE_LOCK).await;
        Drained {
            serializer: self.serializer,
            watchdog: self.watchdog,
        }
    }
}

pub(crate) struct Drained<'a> {
    serializer: &'a Serializer,
    watchdog: &'a Arc<WatchdogLock>,
}

impl<'a> Drained<'a> {
    pub(crate) async fn lock_decision(self) -> DecisionHeld<'a> {
        let decision = self.serializer.acquire(DECISION_LOCK).await;
        DecisionHeld {
            serializer: self.serializer,
            watchdog: self.watchdog,
            decision,
        }
    }
}

pub(crate) struct DecisionHeld<'a> {
    serializer: &'a Serializer,
    watchdog: &'a Arc<WatchdogLock>,
    decision: LockToken,
}

impl<'a> DecisionHeld<'a> {
    /// On failure the decision lock is released with `self`.
    pub(crate) async fn lock_cross_process(self) -> Result<CrossHeld<'a>> {
        let cross = self.watchdog.acquire().await?;
        Ok(CrossHeld {
            cross,
            decision: self.decision,
            serializer: self.serializer,
        })
    }
}

pub(crate) struct CrossHeld<'a> {
    // Field order is drop order.
    cross: WatchdogGuard,
    decision: LockToken,
    serializer: &'a Serializer,
}

impl CrossHeld<'_> {
    pub(crate) async fn snapshot(&self, projection: &StateProjection) -> ProjectionSnapshot {
        projection.snapshot().await
    }

    pub(crate) fn release(self) {
        let CrossHeld {
            cross,
            decision,
            serializer,
        } = self;
        if let Err(err) = cross.release() {
            tracing::error!(?err, "failed to release cross-process lock");
        }
        serializer.release(decision);
    }
}
