use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use core_types::{Address, AddressState, ProjectionSnapshot, Request, SimulatedResponse, Simulator};
use infra_mutex::{LockToken, Serializer, STATE_LOCK};
use parking_lot::RwLock;

/// Live upcoming state of every followed address.
///
/// All mutation happens while the `state` lock of the shared serializer is held; readers only get
/// owned snapshots.
pub struct StateProjection {
    serializer: Arc<Serializer>,
    live: RwLock<ProjectionSnapshot>,
}

impl StateProjection {
    pub fn new(serializer: Arc<Serializer>) -> Self {
        Self {
            serializer,
            live: RwLock::new(ProjectionSnapshot::default()),
        }
    }

    pub fn serializer(&self) -> &Arc<Serializer> {
        &self.serializer
    }

    pub async fn snapshot(&self) -> ProjectionSnapshot {
        let token = self.serializer.acquire(STATE_LOCK).await;
        let snapshot = self.snapshot_locked(&token);
        token.release();
        snapshot
    }

    /// Clones the live state on behalf of a caller that already holds the state lock.
    pub fn snapshot_locked(&self, token: &LockToken) -> ProjectionSnapshot {
        assert_eq!(
            token.name(),
            STATE_LOCK,
            "projection snapshot taken under the wrong lock"
        );
        self.live.read().clone()
    }

    /// Starts tracking `address`. Returns `false` if it was already followed.
    pub async fn follow(&self, address: &str, state: AddressState) -> bool {
        let token = self.serializer.acquire(STATE_LOCK).await;
        let added = self.live.write().follow(address, state);
        token.release();
        if added {
            tracing::debug!(address, "following address");
        }
        added
    }

    pub async fn is_followed(&self, address: &str) -> bool {
        let token = self.serializer.acquire(STATE_LOCK).await;
        let followed = self.live.read().contains(address);
        token.release();
        followed
    }

    /// Folds a request into the projection: the request is executed by `simulator` against a copy
    /// of the live state and the copy replaces the live state in one step. On error the live state
    /// is left untouched.
    pub async fn apply_request(
        &self,
        request: &Request,
        simulator: &dyn Simulator,
    ) -> Result<Vec<SimulatedResponse>> {
        let token = self.serializer.acquire(STATE_LOCK).await;
        let mut next = self.snapshot_locked(&token);
        let responses = simulator
            .simulate(request, &request.target, &mut next)
            .await?;
        *self.live.write() = next;
        token.release();
        tracing::debug!(
            tx_id = %request.tx_id,
            target = %request.target,
            responses = responses.len(),
            "request folded into projection"
        );
        Ok(responses)
    }

    /// Runs `f` while holding the state lock, for mutations of structures that must be ordered
    /// with projection updates.
    pub async fn with_state_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let token = self.serializer.acquire(STATE_LOCK).await;
        let out = f();
        token.release();
        out
    }

    pub async fn followed(&self) -> BTreeSet<Address> {
        let snapshot = self.snapshot().await;
        snapshot
            .state_vars
            .keys()
            .chain(snapshot.balances.keys())
            .cloned()
            .collect()
    }
}

/// Addresses that responded in a projected execution, in response order, without repeats.
pub fn responding_addresses(responses: &[SimulatedResponse]) -> Vec<Address> {
    let mut out: Vec<Address> = Vec::with_capacity(responses.len());
    for response in responses {
        if !out.contains(&response.address) {
            out.push(response.address.clone());
        }
    }
    out
}
