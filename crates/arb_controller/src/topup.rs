use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use core_types::BASE_ASSET;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::ReactiveController;

/// Keeps pools funded with enough base asset to pay for their own responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopUpConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub initial_delay_ms: u64,
    /// Pools at or below this base balance get topped up.
    pub min_balance: i64,
    pub amount: u64,
}

impl Default for TopUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            initial_delay_ms: 100,
            min_balance: 50_000,
            amount: 10_000,
        }
    }
}

impl ReactiveController {
    /// One sweep over the pools of all tracked instances. Returns the number of payments sent.
    pub async fn top_up_pools(&self) -> usize {
        let cfg = &self.cfg.topup;
        let snapshot = self.projection.snapshot().await;
        let pools = self.registry.read().pools();
        let mut sent = 0;
        for pool in pools {
            if !snapshot.contains(&pool) {
                continue;
            }
            let balance = snapshot.balance(&pool, BASE_ASSET);
            if balance > cfg.min_balance {
                continue;
            }
            tracing::info!(%pool, balance, amount = cfg.amount, "pool base balance low, topping up");
            match self.ledger.send_payment(&pool, cfg.amount).await {
                Ok(Some(tx_id)) => {
                    sent += 1;
                    self.stats.topups.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("arb.topup").increment(1);
                    tracing::info!(%pool, %tx_id, "top-up sent");
                }
                Ok(None) => tracing::warn!(%pool, "top-up payment not composed"),
                Err(err) => tracing::warn!(%pool, ?err, "top-up payment failed"),
            }
        }
        tracing::debug!(sent, "top-up sweep done");
        sent
    }

    pub fn spawn_topup_sweep(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let cfg = self.cfg.topup.clone();
        if !cfg.enabled {
            return None;
        }
        let ctl = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(cfg.initial_delay_ms)).await;
            let mut interval = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
            loop {
                interval.tick().await;
                ctl.top_up_pools().await;
            }
        }))
    }
}
