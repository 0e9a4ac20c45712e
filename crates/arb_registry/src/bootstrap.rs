use anyhow::{Context, Result};
use core_types::{Address, ArbError, InstanceCatalog, InstanceDefinition, InstanceDependencies};
use serde::{Deserialize, Serialize};

use crate::TrackedInstance;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base definitions whose derived instances are tracked.
    #[serde(default)]
    pub base_addresses: Vec<Address>,
    /// Static instance list. When non-empty, discovery by base is skipped and every listed
    /// instance is owned.
    #[serde(default)]
    pub instances: Vec<Address>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl RegistryConfig {
    fn owns(&self, definition: &InstanceDefinition) -> bool {
        match (&self.owner, &definition.owner) {
            (Some(mine), Some(theirs)) => !mine.is_empty() && mine == theirs,
            _ => false,
        }
    }

    fn has_owner(&self) -> bool {
        self.owner.as_deref().is_some_and(|o| !o.trim().is_empty())
    }
}

/// An instance ready to be registered, with the addresses the projection must follow for it.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub instance: TrackedInstance,
    pub followed: Vec<Address>,
}

impl Discovered {
    fn new(definition: &InstanceDefinition, deps: InstanceDependencies, owned: bool) -> Self {
        let mut instance = TrackedInstance::new(&definition.address, owned).with_dependencies(&deps);
        if !definition.base.is_empty() {
            instance = instance.with_base(&definition.base);
        }
        let mut followed = vec![definition.address.clone()];
        for address in deps.trigger.iter().chain(&deps.followed).chain(&deps.pools) {
            if !followed.contains(address) {
                followed.push(address.clone());
            }
        }
        Self { instance, followed }
    }
}

/// Enumerates the instances this process tracks at startup.
///
/// Fails with [`ArbError::Config`] when neither a static list nor an owner is configured.
pub async fn discover_instances(
    cfg: &RegistryConfig,
    catalog: &dyn InstanceCatalog,
) -> Result<Vec<Discovered>> {
    let mut out = Vec::new();
    if !cfg.instances.is_empty() {
        for address in &cfg.instances {
            let definition = catalog
                .definition(address)
                .await
                .with_context(|| format!("read definition of {address}"))?;
            let deps = catalog
                .dependencies(&definition)
                .await
                .with_context(|| format!("resolve dependencies of {address}"))?;
            out.push(Discovered::new(&definition, deps, true));
        }
        tracing::info!(count = out.len(), "using static instance list");
        return Ok(out);
    }

    if !cfg.has_owner() {
        return Err(ArbError::Config("neither owner nor instance list configured".to_string()).into());
    }

    let definitions = catalog
        .instances_by_base(&cfg.base_addresses)
        .await
        .context("enumerate instances by base")?;
    for definition in definitions {
        let owned = cfg.owns(&definition);
        let deps = catalog
            .dependencies(&definition)
            .await
            .with_context(|| format!("resolve dependencies of {}", definition.address))?;
        out.push(Discovered::new(&definition, deps, owned));
    }
    tracing::info!(
        all = out.len(),
        mine = out.iter().filter(|d| d.instance.owned).count(),
        "discovered instances"
    );
    Ok(out)
}

/// Handles a definition-applied event. Returns `None` when the definition is not derived from a
/// tracked base.
pub async fn accept_definition(
    cfg: &RegistryConfig,
    catalog: &dyn InstanceCatalog,
    definition: &InstanceDefinition,
) -> Result<Option<Discovered>> {
    if !cfg.base_addresses.contains(&definition.base) {
        return Ok(None);
    }
    let owned = cfg.owns(definition);
    let deps = catalog
        .dependencies(definition)
        .await
        .with_context(|| format!("resolve dependencies of {}", definition.address))?;
    tracing::info!(address = %definition.address, owned, "new instance defined");
    Ok(Some(Discovered::new(definition, deps, owned)))
}
