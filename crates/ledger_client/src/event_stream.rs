use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use core_types::LedgerEvent;
use futures::{SinkExt, StreamExt};
use infra_bus::EventBus;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Reconnect delay: starts at 500 ms, doubles after every wait, capped at 30 s.
#[derive(Debug)]
struct Backoff {
    current_ms: u64,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current_ms: INITIAL_BACKOFF_MS,
        }
    }

    /// Delay to wait now; the following call returns twice as much.
    fn next(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms);
        self.current_ms = (self.current_ms * 2).min(MAX_BACKOFF_MS);
        delay
    }

    fn reset(&mut self) {
        self.current_ms = INITIAL_BACKOFF_MS;
    }
}

/// Streams ledger events from the node sidecar onto `bus`, reconnecting forever.
///
/// Returns only once the dispatcher side of the bus is gone.
pub async fn run_event_stream(bus: EventBus<LedgerEvent>, url: String) {
    let mut backoff = Backoff::new();
    loop {
        match connect_and_stream(&bus, &url).await {
            Ok(()) => {
                tracing::info!(%url, "ledger stream closed, reconnecting");
                backoff.reset();
            }
            Err(err) => {
                tracing::warn!(
                    ?err,
                    backoff_ms = backoff.current_ms,
                    "ledger stream error, retrying"
                );
            }
        }
        if bus.is_closed() {
            tracing::info!("event bus closed, ledger stream exiting");
            return;
        }
        metrics::counter!("ledger.stream_reconnect").increment(1);
        tokio::time::sleep(backoff.next()).await;
    }
}

async fn connect_and_stream(bus: &EventBus<LedgerEvent>, url: &str) -> Result<()> {
    let (mut ws, _) = connect_async(url).await?;
    tracing::info!(url, "ledger stream connected");

    let subscribe = serde_json::json!({ "type": "subscribe", "channel": "ledger_events" }).to_string();
    ws.send(Message::Text(subscribe.into())).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                if let Some(event) = decode_frame(&text) {
                    bus.publish(event).await?;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Decodes one text frame. Frames that are not ledger events (acks, heartbeats) yield `None`.
pub fn decode_frame(text: &str) -> Option<LedgerEvent> {
    match serde_json::from_str::<LedgerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            record_decode_error(&err);
            None
        }
    }
}

static DECODE_ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

fn record_decode_error(err: &serde_json::Error) {
    metrics::counter!("ledger.event_decode_error").increment(1);
    let count = DECODE_ERROR_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if count.is_power_of_two() {
        tracing::warn!(%err, count, "dropping undecodable ledger frame");
    }
}
