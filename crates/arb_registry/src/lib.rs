use std::collections::{BTreeMap, BTreeSet, HashMap};

use core_types::{Address, Asset, InstanceDependencies, TxId, BASE_ASSET};
use serde::Serialize;

mod bootstrap;

pub use bootstrap::{accept_definition, discover_instances, Discovered, RegistryConfig};

/// One monitored arbitrage deployment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackedInstance {
    pub address: Address,
    pub base: Option<Address>,
    /// Addresses whose activity triggers a re-evaluation of this instance.
    pub dependencies: BTreeSet<Address>,
    pub pools: BTreeSet<Address>,
    pub profit_asset: Asset,
    /// Whether this process acts on the instance.
    pub owned: bool,
    pub last_root_trigger: Option<TxId>,
}

impl TrackedInstance {
    pub fn new(address: &str, owned: bool) -> Self {
        Self {
            address: address.to_string(),
            base: None,
            dependencies: BTreeSet::new(),
            pools: BTreeSet::new(),
            profit_asset: BASE_ASSET.to_string(),
            owned,
            last_root_trigger: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &InstanceDependencies) -> Self {
        self.dependencies.extend(deps.trigger.iter().cloned());
        self.pools.extend(deps.pools.iter().cloned());
        self.profit_asset = deps.profit_asset.clone();
        self
    }

    pub fn with_base(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }
}

/// Index from dependency addresses to the owned instances that must react to them.
#[derive(Debug, Default)]
pub struct Registry {
    instances: BTreeMap<Address, TrackedInstance>,
    by_dependency: HashMap<Address, BTreeSet<Address>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instance, or merges dependency and pool sets into an existing one.
    /// Returns `true` when the address was not tracked before.
    pub fn register(&mut self, instance: TrackedInstance) -> bool {
        let address = instance.address.clone();
        let added = match self.instances.get_mut(&address) {
            Some(existing) => {
                existing.dependencies.extend(instance.dependencies);
                existing.pools.extend(instance.pools);
                if existing.base.is_none() {
                    existing.base = instance.base;
                }
                false
            }
            None => {
                self.instances.insert(address.clone(), instance);
                true
            }
        };
        self.reindex(&address);
        added
    }

    fn reindex(&mut self, address: &str) {
        let Some(instance) = self.instances.get(address) else {
            return;
        };
        if !instance.owned {
            return;
        }
        for dep in &instance.dependencies {
            self.by_dependency
                .entry(dep.clone())
                .or_default()
                .insert(instance.address.clone());
        }
    }

    /// Owned instances whose dependency set intersects `addresses`, sorted and deduplicated.
    pub fn resolve(&self, addresses: &[Address]) -> Vec<Address> {
        let mut out = BTreeSet::new();
        for address in addresses {
            if let Some(instances) = self.by_dependency.get(address) {
                out.extend(instances.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    /// Records the root trigger that caused activity affecting `address`. Returns `false` when
    /// it is the same root as the previously recorded one, i.e. the event is a repeat.
    pub fn observe_root_trigger(&mut self, address: &str, root: &str) -> bool {
        let Some(instance) = self.instances.get_mut(address) else {
            return false;
        };
        if instance.last_root_trigger.as_deref() == Some(root) {
            return false;
        }
        instance.last_root_trigger = Some(root.to_string());
        true
    }

    pub fn get(&self, address: &str) -> Option<&TrackedInstance> {
        self.instances.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.instances.contains_key(address)
    }

    pub fn owned(&self) -> Vec<Address> {
        self.instances
            .values()
            .filter(|i| i.owned)
            .map(|i| i.address.clone())
            .collect()
    }

    pub fn instances(&self) -> Vec<TrackedInstance> {
        self.instances.values().cloned().collect()
    }

    /// Pools of every tracked instance, owned or not.
    pub fn pools(&self) -> BTreeSet<Address> {
        self.instances
            .values()
            .flat_map(|i| i.pools.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
