use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{
    Address, AddressState, ArbError, InstanceCatalog, InstanceDefinition, InstanceDependencies,
    Ledger, ProjectionSnapshot, Request, SimulatedResponse, Simulator, TxId,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

mod event_stream;
mod oracle;

pub use event_stream::{decode_frame, run_event_stream};
pub use oracle::StaticPriceOracle;

/// JSON client for the ledger node sidecar. Implements every collaborator trait except pricing.
#[derive(Clone)]
pub struct NodeClient {
    http: Client,
    endpoint: String,
    operator: Address,
}

#[derive(Debug, Deserialize)]
struct Composed {
    tx_id: Option<TxId>,
}

#[derive(Serialize)]
struct SimulateBody<'a> {
    request: &'a Request,
    target: &'a str,
    snapshot: &'a ProjectionSnapshot,
}

#[derive(Deserialize)]
struct Simulated {
    responses: Vec<SimulatedResponse>,
    snapshot: ProjectionSnapshot,
}

impl NodeClient {
    pub fn new(endpoint: impl Into<String>, operator: impl Into<Address>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            operator: operator.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self
            .http
            .get(format!("{}{path}", self.endpoint))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        decode(path, res).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let res = self
            .http
            .post(format!("{}{path}", self.endpoint))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        decode(path, res).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, res: Response) -> Result<T> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(ArbError::Collaborator(format!("{path} returned {status}: {body}")).into());
    }
    res.json::<T>()
        .await
        .with_context(|| format!("decode {path} response"))
}

#[async_trait]
impl Ledger for NodeClient {
    async fn submit_request(
        &self,
        target: &str,
        amount: u64,
        payload: &Value,
    ) -> Result<Option<TxId>> {
        let body = json!({
            "author": self.operator,
            "target": target,
            "amount": amount,
            "payload": payload,
        });
        let composed: Composed = self.post_json("/requests", &body).await?;
        if composed.tx_id.is_none() {
            tracing::warn!(target, amount, "node did not compose the request");
        }
        Ok(composed.tx_id)
    }

    async fn read_transaction(&self, tx_id: &str) -> Result<Request> {
        self.get_json(&format!("/transactions/{tx_id}")).await
    }

    async fn read_address_state(&self, address: &str) -> Result<AddressState> {
        self.get_json(&format!("/state/{address}")).await
    }

    async fn send_payment(&self, to: &str, amount: u64) -> Result<Option<TxId>> {
        let body = json!({ "from": self.operator, "to": to, "amount": amount });
        let composed: Composed = self.post_json("/payments", &body).await?;
        Ok(composed.tx_id)
    }
}

#[async_trait]
impl Simulator for NodeClient {
    async fn simulate(
        &self,
        request: &Request,
        target: &str,
        snapshot: &mut ProjectionSnapshot,
    ) -> Result<Vec<SimulatedResponse>> {
        let body = SimulateBody {
            request,
            target,
            snapshot,
        };
        let simulated: Simulated = self.post_json("/simulate", &body).await?;
        *snapshot = simulated.snapshot;
        Ok(simulated.responses)
    }
}

#[async_trait]
impl InstanceCatalog for NodeClient {
    async fn instances_by_base(&self, bases: &[Address]) -> Result<Vec<InstanceDefinition>> {
        let query: Vec<(&str, &str)> = bases.iter().map(|b| ("base", b.as_str())).collect();
        let res = self
            .http
            .get(format!("{}/instances", self.endpoint))
            .query(&query)
            .send()
            .await
            .context("GET /instances")?;
        decode("/instances", res).await
    }

    async fn definition(&self, address: &str) -> Result<InstanceDefinition> {
        self.get_json(&format!("/instances/{address}")).await
    }

    async fn dependencies(&self, definition: &InstanceDefinition) -> Result<InstanceDependencies> {
        self.get_json(&format!("/instances/{}/dependencies", definition.address))
            .await
    }
}
