use std::sync::Arc;

use arb_controller::{ReactiveController, StatsSnapshot};
use arb_registry::TrackedInstance;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use core_types::LedgerEvent;
use infra_bus::EventBus;
use ledger_client::StaticPriceOracle;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use watchdog_lock::HolderInfo;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ctl: Arc<ReactiveController>,
    pub(crate) bus: EventBus<LedgerEvent>,
    pub(crate) oracle: Arc<StaticPriceOracle>,
    pub(crate) prometheus: PrometheusHandle,
    pub(crate) watchdog_ceiling_secs: u64,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    tracked: usize,
    owned: usize,
    stats: StatsSnapshot,
}

#[derive(Serialize)]
struct WatchdogResp {
    held: bool,
    ceiling_secs: u64,
    holder: Option<HolderInfo>,
}

#[derive(Debug, Deserialize)]
struct PriceReq {
    asset: String,
    price: f64,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/instances", get(instances))
        .route("/state/watchdog", get(watchdog))
        .route("/control/reevaluate", post(reevaluate))
        .route("/control/price", post(set_price))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok",
        tracked: state.ctl.instances().len(),
        owned: state.ctl.owned_instances().len(),
        stats: state.ctl.stats(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn instances(State(state): State<AppState>) -> Json<Vec<TrackedInstance>> {
    Json(state.ctl.instances())
}

async fn watchdog(State(state): State<AppState>) -> Json<WatchdogResp> {
    let holder = state.ctl.watchdog_holder();
    Json(WatchdogResp {
        held: holder.is_some(),
        ceiling_secs: state.watchdog_ceiling_secs,
        holder,
    })
}

async fn reevaluate(State(state): State<AppState>) -> impl IntoResponse {
    publish(&state, LedgerEvent::ExternalPriceUpdated, serde_json::json!({"ok": true}))
}

async fn set_price(State(state): State<AppState>, Json(req): Json<PriceReq>) -> impl IntoResponse {
    if !req.price.is_finite() || req.price < 0.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "price must be finite and non-negative"})),
        )
            .into_response();
    }
    let changed = state.oracle.set_price(&req.asset, req.price);
    tracing::info!(asset = %req.asset, price = req.price, changed, "price updated");
    if !changed {
        return Json(serde_json::json!({"ok": true, "changed": false})).into_response();
    }
    publish(
        &state,
        LedgerEvent::ExternalPriceUpdated,
        serde_json::json!({"ok": true, "changed": true}),
    )
}

fn publish(state: &AppState, event: LedgerEvent, ok: serde_json::Value) -> axum::response::Response {
    match state.bus.try_publish(event) {
        Ok(()) => Json(ok).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}
