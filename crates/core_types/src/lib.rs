use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Address = String;
pub type TxId = String;
pub type Asset = String;

pub type StateVars = BTreeMap<String, Value>;
pub type Balances = BTreeMap<Asset, i64>;

/// Asset key used for the ledger's native currency in balance maps.
pub const BASE_ASSET: &str = "base";

/// Transaction id carried by requests that only ever exist inside a simulation.
pub const SYNTHETIC_TX_ID: &str = "synthetic_trigger";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddressState {
    #[serde(default)]
    pub state_vars: StateVars,
    #[serde(default)]
    pub balances: Balances,
}

/// Owned copy of the upcoming (not yet finalized) state of every followed address.
///
/// Simulations mutate a snapshot in place; the live projection is never handed out by reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectionSnapshot {
    #[serde(default)]
    pub state_vars: BTreeMap<Address, StateVars>,
    #[serde(default)]
    pub balances: BTreeMap<Address, Balances>,
}

impl ProjectionSnapshot {
    pub fn contains(&self, address: &str) -> bool {
        self.state_vars.contains_key(address) || self.balances.contains_key(address)
    }

    /// Seeds an address from its finalized state. Already-followed addresses keep their
    /// upcoming state.
    pub fn follow(&mut self, address: &str, state: AddressState) -> bool {
        if self.contains(address) {
            return false;
        }
        self.state_vars.insert(address.to_string(), state.state_vars);
        self.balances.insert(address.to_string(), state.balances);
        true
    }

    pub fn balances_of(&self, address: &str) -> Option<&Balances> {
        self.balances.get(address)
    }

    pub fn balance(&self, address: &str, asset: &str) -> i64 {
        self.balances
            .get(address)
            .and_then(|b| b.get(asset))
            .copied()
            .unwrap_or(0)
    }

    pub fn credit(&mut self, address: &str, asset: &str, delta: i64) {
        let entry = self
            .balances
            .entry(address.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_insert(0);
        *entry += delta;
    }

    pub fn state_var(&self, address: &str, name: &str) -> Option<&Value> {
        self.state_vars.get(address).and_then(|vars| vars.get(name))
    }

    pub fn set_state_var(&mut self, address: &str, name: &str, value: Value) {
        self.state_vars
            .entry(address.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// First asset (in key order) whose balance at `address` is below zero.
    pub fn negative_balance(&self, address: &str) -> Option<(Asset, i64)> {
        self.balances
            .get(address)?
            .iter()
            .find(|(_, balance)| **balance < 0)
            .map(|(asset, balance)| (asset.clone(), *balance))
    }
}

/// A request (trigger transaction) sent to an agent address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub tx_id: TxId,
    pub author: Address,
    pub target: Address,
    pub amount: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn synthetic(author: &str, target: &str, amount: u64, payload: Value) -> Self {
        Self {
            tx_id: SYNTHETIC_TX_ID.to_string(),
            author: author.to_string(),
            target: target.to_string(),
            amount,
            payload,
        }
    }
}

/// One step of a simulated execution: either succeeded with response variables or bounced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatedResponse {
    pub address: Address,
    pub bounced: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub response_vars: Map<String, Value>,
}

impl SimulatedResponse {
    pub fn succeeded(address: &str, response_vars: Map<String, Value>) -> Self {
        Self {
            address: address.to_string(),
            bounced: false,
            error: None,
            response_vars,
        }
    }

    pub fn bounced(address: &str, error: &str) -> Self {
        Self {
            address: address.to_string(),
            bounced: true,
            error: Some(error.to_string()),
            response_vars: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFinalized {
    pub address: Address,
    pub trigger_tx: TxId,
    pub root_trigger_tx: TxId,
    pub trigger_address: Address,
    pub bounced: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub response_vars: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDefinition {
    pub address: Address,
    pub base: Address,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDependencies {
    /// Addresses whose activity must trigger a re-evaluation of the instance.
    #[serde(default)]
    pub trigger: Vec<Address>,
    /// Addresses whose state the projection must track but which never trigger on their own.
    #[serde(default)]
    pub followed: Vec<Address>,
    /// Liquidity pools the instance trades against.
    #[serde(default)]
    pub pools: Vec<Address>,
    #[serde(default = "default_profit_asset")]
    pub profit_asset: Asset,
}

impl Default for InstanceDependencies {
    fn default() -> Self {
        Self {
            trigger: Vec::new(),
            followed: Vec::new(),
            pools: Vec::new(),
            profit_asset: default_profit_asset(),
        }
    }
}

fn default_profit_asset() -> Asset {
    BASE_ASSET.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    RequestObserved(Request),
    ResponseFinalized(ResponseFinalized),
    ExternalPriceUpdated,
    InstanceDefined(InstanceDefinition),
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestObserved(_) => "request_observed",
            Self::ResponseFinalized(_) => "response_finalized",
            Self::ExternalPriceUpdated => "external_price_updated",
            Self::InstanceDefined(_) => "instance_defined",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    WouldBounce { error: String },
    NegativeBalance { asset: Asset, balance: i64 },
    ProfitUnknown,
    ProfitTooSmall { profit: f64, threshold: f64 },
    SubmissionFailed,
}

impl RejectReason {
    /// Stable label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WouldBounce { .. } => "would_bounce",
            Self::NegativeBalance { .. } => "negative_balance",
            Self::ProfitUnknown => "profit_unknown",
            Self::ProfitTooSmall { .. } => "profit_too_small",
            Self::SubmissionFailed => "submission_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBounce { error } => write!(f, "would bounce: {error}"),
            Self::NegativeBalance { asset, balance } => {
                write!(f, "{asset} balance would become negative: {balance}")
            }
            Self::ProfitUnknown => f.write_str("profit missing from simulated response"),
            Self::ProfitTooSmall { profit, threshold } => {
                write!(f, "profit too small: {profit:.4} < {threshold:.4}")
            }
            Self::SubmissionFailed => f.write_str("submission failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept { profit_reference: Option<f64> },
    Reject(RejectReason),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Submitted { tx_id: TxId },
    Rejected(RejectReason),
}

impl CycleOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Error)]
pub enum ArbError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("collaborator failed: {0}")]
    Collaborator(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes a hypothetical request against a projection snapshot.
///
/// Implementations mutate `snapshot` to the projected post-execution state and must not touch
/// real ledger state.
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn simulate(
        &self,
        request: &Request,
        target: &str,
        snapshot: &mut ProjectionSnapshot,
    ) -> Result<Vec<SimulatedResponse>>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Signs and broadcasts a request. `Ok(None)` means the node refused to compose it.
    async fn submit_request(&self, target: &str, amount: u64, payload: &Value)
        -> Result<Option<TxId>>;
    async fn read_transaction(&self, tx_id: &str) -> Result<Request>;
    async fn read_address_state(&self, address: &str) -> Result<AddressState>;
    async fn send_payment(&self, to: &str, amount: u64) -> Result<Option<TxId>>;
}

#[async_trait]
pub trait InstanceCatalog: Send + Sync {
    async fn instances_by_base(&self, bases: &[Address]) -> Result<Vec<InstanceDefinition>>;
    async fn definition(&self, address: &str) -> Result<InstanceDefinition>;
    async fn dependencies(&self, definition: &InstanceDefinition) -> Result<InstanceDependencies>;
}

pub trait PriceOracle: Send + Sync {
    /// Converts `amount` of `asset` into the reference currency, `None` if the asset is unpriced.
    fn to_reference(&self, asset: &str, amount: f64) -> Option<f64>;
}
