use std::sync::atomic::Ordering;

use anyhow::Result;
use core_types::{CycleOutcome, Decision, RejectReason, Request, BASE_ASSET};

use crate::lock_order::{CrossHeld, LockOrder};
use crate::{policy, ReactiveController};

impl ReactiveController {
    /// Runs one decision cycle for `instance`: simulate an arbitrage request against a fresh
    /// snapshot and submit it for real only if the simulation is accepted.
    ///
    /// Rejections are `Ok`. Errors mean a collaborator failed mid-cycle; locks are released
    /// either way.
    pub async fn estimate_and_act(&self, instance: &str) -> Result<CycleOutcome> {
        let held = LockOrder::new(&self.serializer, &self.watchdog)
            .drain_state()
            .await
            .lock_decision()
            .await
            .lock_cross_process()
            .await?;
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        tracing::info!(instance, "===== estimate and act");

        let result = self.decide_and_submit(instance, &held).await;
        held.release();

        match &result {
            Ok(outcome) => {
                metrics::counter!("arb.cycle", "outcome" => outcome.label()).increment(1);
                match outcome {
                    CycleOutcome::Submitted { tx_id } => {
                        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(instance, %tx_id, "arbitrage request submitted");
                    }
                    CycleOutcome::Rejected(reason) => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("arb.reject", "reason" => reason.code()).increment(1);
                        tracing::info!(instance, %reason, "arbitrage rejected");
                    }
                }
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("arb.cycle", "outcome" => "failed").increment(1);
                tracing::warn!(instance, ?err, "decision cycle failed");
            }
        }
        result
    }

    async fn decide_and_submit(&self, instance: &str, held: &CrossHeld<'_>) -> Result<CycleOutcome> {
        let mut snapshot = held.snapshot(&self.projection).await;
        let request = Request::synthetic(
            &self.cfg.operator_address,
            instance,
            self.cfg.nominal_amount,
            self.cfg.trigger_payload.clone(),
        );
        let responses = self
            .simulator
            .simulate(&request, instance, &mut snapshot)
            .await?;
        tracing::debug!(instance, ?responses, "simulated arbitrage request");

        let profit_asset = self
            .registry
            .read()
            .get(instance)
            .map(|i| i.profit_asset.clone())
            .unwrap_or_else(|| BASE_ASSET.to_string());
        let decision = policy::evaluate(
            instance,
            &responses,
            &snapshot,
            &profit_asset,
            self.cfg.min_profit,
            &*self.oracle,
        );
        let profit_reference = match decision {
            Decision::Reject(reason) => return Ok(CycleOutcome::Rejected(reason)),
            Decision::Accept { profit_reference } => profit_reference,
        };
        tracing::info!(instance, ?profit_reference, "simulation accepted, submitting");

        let tx_id = match self
            .ledger
            .submit_request(instance, request.amount, &request.payload)
            .await
        {
            Ok(Some(tx_id)) => tx_id,
            Ok(None) => return Ok(CycleOutcome::Rejected(RejectReason::SubmissionFailed)),
            Err(err) => {
                tracing::warn!(instance, ?err, "submission errored");
                return Ok(CycleOutcome::Rejected(RejectReason::SubmissionFailed));
            }
        };
        metrics::counter!("arb.submission").increment(1);

        // Fold our own request into the projection now; the ledger echo of it is skipped.
        let submitted = match self.ledger.read_transaction(&tx_id).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(%tx_id, ?err, "read-back failed, folding the request as sent");
                Request {
                    tx_id: tx_id.clone(),
                    ..request
                }
            }
        };
        if let Err(err) = self
            .projection
            .apply_request(&submitted, &*self.simulator)
            .await
        {
            tracing::warn!(%tx_id, ?err, "failed to fold submitted request into projection");
        }
        Ok(CycleOutcome::Submitted { tx_id })
    }

    /// Re-evaluates every owned instance, one after another.
    pub async fn estimate_all(&self) -> Vec<(String, Result<CycleOutcome>)> {
        let owned = self.owned_instances();
        let mut out = Vec::with_capacity(owned.len());
        for instance in owned {
            let outcome = self.estimate_and_act(&instance).await;
            out.push((instance, outcome));
        }
        out
    }
}
