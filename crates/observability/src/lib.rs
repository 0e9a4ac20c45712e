use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

/// Installs the global Prometheus recorder once; later calls return the same handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_arb_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_arb_metrics() {
    describe_counter!("arb.cycle", Unit::Count, "Decision cycles by outcome");
    describe_counter!("arb.reject", Unit::Count, "Rejected cycles by reason");
    describe_counter!("arb.submission", Unit::Count, "Arbitrage requests broadcast");
    describe_counter!("arb.topup", Unit::Count, "Pool top-up payments sent");
    describe_counter!(
        "ledger.event_decode_error",
        Unit::Count,
        "Ledger stream frames that failed to decode"
    );
    describe_counter!(
        "ledger.stream_reconnect",
        Unit::Count,
        "Ledger stream reconnect attempts"
    );
}
