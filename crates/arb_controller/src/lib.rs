use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arb_registry::{Discovered, Registry, RegistryConfig, TrackedInstance};
use core_types::{Address, InstanceCatalog, Ledger, PriceOracle, Simulator};
use infra_mutex::Serializer;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use state_projection::StateProjection;
use watchdog_lock::{HolderInfo, WatchdogLock};

mod cycle;
mod dispatcher;
mod lock_order;
pub mod policy;
mod topup;

#[cfg(test)]
mod tests;

pub use topup::TopUpConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address our own requests are authored by.
    pub operator_address: Address,
    /// Minimum predicted profit in the reference currency. `None` disables profit gating.
    pub min_profit: Option<f64>,
    /// Amount attached to every arbitrage request.
    pub nominal_amount: u64,
    pub trigger_payload: Value,
    pub topup: TopUpConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operator_address: String::new(),
            min_profit: Some(0.1),
            nominal_amount: 10_000,
            trigger_payload: json!({ "arb": 1 }),
            topup: TopUpConfig::default(),
        }
    }
}

/// External systems the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub simulator: Arc<dyn Simulator>,
    pub ledger: Arc<dyn Ledger>,
    pub catalog: Arc<dyn InstanceCatalog>,
    pub oracle: Arc<dyn PriceOracle>,
}

#[derive(Debug, Default)]
struct ControllerStats {
    cycles: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    topups: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub submitted: u64,
    pub rejected: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub topups: u64,
}

impl ControllerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            topups: self.topups.load(Ordering::Relaxed),
        }
    }
}

pub struct ReactiveController {
    cfg: ControllerConfig,
    registry_cfg: RegistryConfig,
    serializer: Arc<Serializer>,
    projection: Arc<StateProjection>,
    watchdog: Arc<WatchdogLock>,
    registry: RwLock<Registry>,
    simulator: Arc<dyn Simulator>,
    ledger: Arc<dyn Ledger>,
    catalog: Arc<dyn InstanceCatalog>,
    oracle: Arc<dyn PriceOracle>,
    stats: ControllerStats,
}

impl ReactiveController {
    pub fn new(
        cfg: ControllerConfig,
        registry_cfg: RegistryConfig,
        projection: Arc<StateProjection>,
        watchdog: Arc<WatchdogLock>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            cfg,
            registry_cfg,
            serializer: projection.serializer().clone(),
            projection,
            watchdog,
            registry: RwLock::new(Registry::new()),
            simulator: collaborators.simulator,
            ledger: collaborators.ledger,
            catalog: collaborators.catalog,
            oracle: collaborators.oracle,
            stats: ControllerStats::default(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn projection(&self) -> &Arc<StateProjection> {
        &self.projection
    }

    /// Discovers the startup instances and registers them.
    pub async fn bootstrap(&self) -> Result<usize> {
        let discovered = arb_registry::discover_instances(&self.registry_cfg, &*self.catalog).await?;
        let count = discovered.len();
        for found in discovered {
            self.register(found).await?;
        }
        let (tracked, owned) = {
            let registry = self.registry.read();
            (registry.len(), registry.owned().len())
        };
        tracing::info!(tracked, owned, "registry bootstrapped");
        Ok(count)
    }

    /// Follows the instance's addresses in the projection, then indexes it. The registry is
    /// mutated under the state lock so registration is ordered with projection updates.
    pub async fn register(&self, discovered: Discovered) -> Result<()> {
        for address in &discovered.followed {
            if self.projection.is_followed(address).await {
                continue;
            }
            let state = self
                .ledger
                .read_address_state(address)
                .await
                .with_context(|| format!("read state of {address}"))?;
            self.projection.follow(address, state).await;
        }
        let address = discovered.instance.address.clone();
        let owned = discovered.instance.owned;
        let added = self
            .projection
            .with_state_lock(|| self.registry.write().register(discovered.instance))
            .await;
        tracing::info!(%address, owned, added, "instance registered");
        Ok(())
    }

    pub fn resolve(&self, addresses: &[Address]) -> Vec<Address> {
        self.registry.read().resolve(addresses)
    }

    pub fn owned_instances(&self) -> Vec<Address> {
        self.registry.read().owned()
    }

    pub fn instances(&self) -> Vec<TrackedInstance> {
        self.registry.read().instances()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn watchdog_holder(&self) -> Option<HolderInfo> {
        self.watchdog.holder()
    }
}
