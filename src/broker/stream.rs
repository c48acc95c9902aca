// =============================================================================
// Tick stream loop — shared WebSocket read loop with reconnect/backoff
// =============================================================================
//
// Each adapter supplies its own URL and message parser; the loop owns
// connection lifecycle. Backoff doubles per failed attempt, capped at 30 s;
// after 10 consecutive failures the loop gives up and returns an error so the
// session layer can mark the user-broker LOGIN_REQUIRED.
//
// The client's own heartbeat timeout stays disabled; tungstenite answers
// transport pings automatically and feed liveness is watched by the watchdog
// task via LTP age.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::TickSender;
use crate::market::Tick;

/// Maximum consecutive failed connection attempts before giving up.
const MAX_ATTEMPTS: u32 = 10;

/// Backoff cap between reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the tick stream until the subscription is torn down or reconnects are
/// exhausted. `stale` is lowered while connected and raised on any gap.
pub async fn run_tick_stream<F>(
    label: &str,
    url: String,
    sender: TickSender,
    stale: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    parse: F,
) -> Result<()>
where
    F: Fn(&str) -> Result<Option<Tick>> + Send + Sync,
{
    let mut attempts: u32 = 0;

    loop {
        match connect_once(label, &url, &sender, &stale, &dropped, &parse).await {
            Ok(()) => {
                // Clean end of stream (unsubscribe/shutdown).
                info!(adapter = label, "tick stream closed");
                return Ok(());
            }
            Err(e) => {
                stale.store(true, Ordering::Relaxed);
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    error!(
                        adapter = label,
                        attempts, error = %e,
                        "tick stream reconnects exhausted"
                    );
                    return Err(e).context("tick stream reconnects exhausted");
                }
                let backoff =
                    Duration::from_secs(1 << attempts.min(5)).min(MAX_BACKOFF);
                warn!(
                    adapter = label,
                    attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "tick stream error — reconnecting"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn connect_once<F>(
    label: &str,
    url: &str,
    sender: &TickSender,
    stale: &Arc<AtomicBool>,
    dropped: &Arc<AtomicU64>,
    parse: &F,
) -> Result<()>
where
    F: Fn(&str) -> Result<Option<Tick>> + Send + Sync,
{
    info!(adapter = label, url = %url, "connecting tick WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect tick WebSocket")?;
    info!(adapter = label, "tick WebSocket connected");
    stale.store(false, Ordering::Relaxed);

    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse(&text) {
                        Ok(Some(tick)) => {
                            // Never block the read loop on a slow consumer.
                            if sender.try_send(tick).is_err() {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Ok(None) => {
                            // Heartbeats and acks fall through silently.
                            debug!(adapter = label, "non-tick message ignored");
                        }
                        Err(e) => {
                            warn!(adapter = label, error = %e, "failed to parse tick message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames handled by tungstenite.
            }
            Some(Err(e)) => {
                return Err(e).context("tick WebSocket read error");
            }
            None => {
                anyhow::bail!("tick WebSocket stream ended");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_capped() {
        let backoffs: Vec<u64> = (1..MAX_ATTEMPTS)
            .map(|attempts| {
                Duration::from_secs(1u64 << attempts.min(5))
                    .min(MAX_BACKOFF)
                    .as_secs()
            })
            .collect();
        assert_eq!(backoffs[0], 2);
        assert!(backoffs.iter().all(|&b| b <= 30));
        assert_eq!(*backoffs.last().unwrap(), 30);
    }
}
