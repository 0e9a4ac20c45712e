use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use core_types::{LedgerEvent, Request, ResponseFinalized};
use infra_mutex::RESPONSE_LOCK;
use state_projection::responding_addresses;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ReactiveController;

impl ReactiveController {
    /// Consumes ledger events in delivery order until the bus closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<LedgerEvent>) {
        tracing::info!("dispatcher started");
        while let Some(event) = events.recv().await {
            let kind = event.kind();
            if let Err(err) = self.handle_event(event).await {
                tracing::warn!(kind, ?err, "event handling failed");
            }
        }
        tracing::info!("event bus closed, dispatcher exiting");
    }

    /// Applies the projection side of `event` inline and spawns the reactions it causes.
    /// The returned handles complete when those reactions are done.
    pub async fn handle_event(self: &Arc<Self>, event: LedgerEvent) -> Result<Vec<JoinHandle<()>>> {
        match event {
            LedgerEvent::RequestObserved(request) => self.on_request(request).await,
            LedgerEvent::ResponseFinalized(response) => Ok(self.on_response(response).await),
            LedgerEvent::ExternalPriceUpdated => {
                let ctl = self.clone();
                Ok(vec![tokio::spawn(async move {
                    ctl.estimate_all().await;
                })])
            }
            LedgerEvent::InstanceDefined(definition) => {
                let accepted =
                    arb_registry::accept_definition(&self.registry_cfg, &*self.catalog, &definition)
                        .await?;
                if let Some(found) = accepted {
                    self.register(found).await?;
                }
                Ok(Vec::new())
            }
        }
    }

    async fn on_request(self: &Arc<Self>, request: Request) -> Result<Vec<JoinHandle<()>>> {
        if request.author == self.cfg.operator_address {
            tracing::debug!(tx_id = %request.tx_id, "skipping our own request");
            return Ok(Vec::new());
        }
        let responses = self
            .projection
            .apply_request(&request, &*self.simulator)
            .await?;
        let mut touched = responding_addresses(&responses);
        if !touched.contains(&request.target) {
            touched.push(request.target.clone());
        }
        let instances = self.resolve(&touched);
        tracing::info!(
            author = %request.author,
            tx_id = %request.tx_id,
            ?touched,
            ?instances,
            "request observed"
        );
        Ok(instances
            .into_iter()
            .map(|instance| self.spawn_cycle(instance))
            .collect())
    }

    /// De-duplicates by root trigger before anything is spawned, so the first delivery of a
    /// root wins regardless of how the runtime schedules the cycles.
    async fn on_response(self: &Arc<Self>, response: ResponseFinalized) -> Vec<JoinHandle<()>> {
        if response.bounced && response.trigger_address == self.cfg.operator_address {
            tracing::info!(
                trigger_tx = %response.trigger_tx,
                error = ?response.error,
                "our request bounced"
            );
            return Vec::new();
        }
        let instances = self.resolve(std::slice::from_ref(&response.address));
        tracing::debug!(
            address = %response.address,
            root = %response.root_trigger_tx,
            trigger = %response.trigger_tx,
            ?instances,
            "response finalized"
        );
        if instances.is_empty() {
            return Vec::new();
        }
        let root = &response.root_trigger_tx;
        let token = self.serializer.acquire(RESPONSE_LOCK).await;
        let (fresh, repeated): (Vec<_>, Vec<_>) = self
            .projection
            .with_state_lock(|| {
                let mut registry = self.registry.write();
                instances
                    .into_iter()
                    .partition(|instance| registry.observe_root_trigger(instance, root))
            })
            .await;
        token.release();
        for instance in &repeated {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%instance, %root, "root trigger already handled");
        }
        fresh
            .into_iter()
            .map(|instance| self.spawn_cycle(instance))
            .collect()
    }

    fn spawn_cycle(self: &Arc<Self>, instance: String) -> JoinHandle<()> {
        let ctl = self.clone();
        tokio::spawn(async move {
            let _ = ctl.estimate_and_act(&instance).await;
        })
    }
}
