use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arb_controller::{Collaborators, ReactiveController};
use core_types::LedgerEvent;
use infra_bus::EventBus;
use infra_mutex::Serializer;
use ledger_client::{run_event_stream, NodeClient, StaticPriceOracle};
use observability::init_metrics;
use state_projection::StateProjection;
use watchdog_lock::WatchdogLock;

use crate::config_loader::AppConfig;
use crate::control_api::{self, AppState};

pub(crate) async fn run(cfg: AppConfig) -> Result<()> {
    let prometheus = init_metrics()?;

    let serializer = Arc::new(Serializer::new());
    let projection = Arc::new(StateProjection::new(serializer));
    let watchdog = Arc::new(WatchdogLock::open(
        &cfg.lock.path,
        Duration::from_secs(cfg.lock.ceiling_secs),
    )?);
    let node = Arc::new(NodeClient::new(
        cfg.node.endpoint.clone(),
        cfg.controller.operator_address.clone(),
    ));
    let oracle = Arc::new(StaticPriceOracle::new(cfg.prices.clone()));
    let ctl = Arc::new(ReactiveController::new(
        cfg.controller.clone(),
        cfg.registry.clone(),
        projection,
        watchdog,
        Collaborators {
            simulator: node.clone(),
            ledger: node.clone(),
            catalog: node,
            oracle: oracle.clone(),
        },
    ));

    let discovered = ctl.bootstrap().await.context("bootstrap registry")?;
    tracing::info!(
        discovered,
        owned = ctl.owned_instances().len(),
        operator = %cfg.controller.operator_address,
        lock = %cfg.lock.path.display(),
        "arbwatch starting"
    );

    let (bus, rx) = EventBus::<LedgerEvent>::channel(cfg.bus_capacity);
    tokio::spawn(ctl.clone().run(rx));
    tokio::spawn(run_event_stream(bus.clone(), cfg.node.events_url.clone()));
    let _topup = ctl.spawn_topup_sweep();
    spawn_initial_estimate(ctl.clone(), cfg.initial_estimate_delay_ms);

    let state = AppState {
        ctl,
        bus,
        oracle,
        prometheus,
        watchdog_ceiling_secs: cfg.lock.ceiling_secs,
    };
    let addr: SocketAddr = cfg
        .control_api
        .bind
        .parse()
        .with_context(|| format!("parse control_api.bind {}", cfg.control_api.bind))?;
    tracing::info!(%addr, "control api started");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        control_api::build_router(state),
    )
    .await?;
    Ok(())
}

fn spawn_initial_estimate(ctl: Arc<ReactiveController>, delay_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let outcomes = ctl.estimate_all().await;
        let submitted = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Ok(o) if o.is_submitted()))
            .count();
        tracing::info!(evaluated = outcomes.len(), submitted, "initial estimate done");
    });
}

/// Takes the cross-process lock and sits on it. Holding past the ceiling ends the process with
/// the watchdog exit code.
pub(crate) async fn hold_lock(path: &Path, ceiling: Duration, hold: Duration) -> Result<()> {
    let lock = Arc::new(WatchdogLock::open(path, ceiling)?);
    let guard = lock.acquire().await?;
    if let Some(holder) = lock.holder() {
        tracing::info!(
            pid = holder.pid,
            acquired_at = %holder.acquired_at,
            ceiling_ms = ceiling.as_millis() as u64,
            hold_ms = hold.as_millis() as u64,
            "holding cross-process lock"
        );
    }
    tokio::time::sleep(hold).await;
    guard.release()?;
    tracing::info!("released cross-process lock");
    Ok(())
}
