use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arb_controller::ControllerConfig;
use arb_registry::RegistryConfig;
use core_types::ArbError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LockConfig {
    pub(crate) path: PathBuf,
    pub(crate) ceiling_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("arbwatch.lock"),
            ceiling_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct NodeConfig {
    pub(crate) endpoint: String,
    pub(crate) events_url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:6611".to_string(),
            events_url: "ws://127.0.0.1:6611/events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ControlApiConfig {
    pub(crate) bind: String,
}

impl Default for ControlApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) registry: RegistryConfig,
    pub(crate) controller: ControllerConfig,
    pub(crate) lock: LockConfig,
    pub(crate) node: NodeConfig,
    pub(crate) control_api: ControlApiConfig,
    /// Reference-currency price per smallest unit, keyed by asset.
    pub(crate) prices: HashMap<String, f64>,
    pub(crate) bus_capacity: usize,
    /// Delay before the first re-evaluation of every owned instance.
    pub(crate) initial_estimate_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            controller: ControllerConfig::default(),
            lock: LockConfig::default(),
            node: NodeConfig::default(),
            control_api: ControlApiConfig::default(),
            prices: HashMap::new(),
            bus_capacity: 4_096,
            initial_estimate_delay_ms: 1_000,
        }
    }
}

pub(crate) fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var("ARBWATCH_CONFIG_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("configs/arbwatch.toml"))
}

pub(crate) fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut cfg = parse_config(&raw).with_context(|| format!("parse config {}", path.display()))?;
    apply_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

fn parse_config(raw: &str) -> Result<AppConfig> {
    Ok(toml::from_str::<AppConfig>(raw)?)
}

fn apply_overrides(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(owner) = var("ARBWATCH_OWNER") {
        cfg.registry.owner = Some(owner);
    }
    if let Some(endpoint) = var("ARBWATCH_NODE_ENDPOINT") {
        cfg.node.endpoint = endpoint;
    }
}

fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.controller.operator_address.trim().is_empty() {
        return Err(ArbError::Config("controller.operator_address is empty".to_string()).into());
    }
    if cfg.lock.ceiling_secs == 0 {
        return Err(ArbError::Config("lock.ceiling_secs must be positive".to_string()).into());
    }
    if let Some(threshold) = cfg.controller.min_profit {
        if !threshold.is_finite() {
            return Err(ArbError::Config("controller.min_profit is not finite".to_string()).into());
        }
    }
    Ok(())
}
