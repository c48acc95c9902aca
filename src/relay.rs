// =============================================================================
// Tick relay — FEED_COLLECTOR mode broadcaster
// =============================================================================
//
// In FEED_COLLECTOR mode the engine runs tick intake plus this WebSocket
// broadcaster and nothing else. Each connected client gets every accepted
// tick as a JSON message; slow clients lag and lose the oldest ticks rather
// than slowing intake.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::market::TickIntake;

pub struct TickRelay {
    intake: Arc<TickIntake>,
    port: u16,
}

impl TickRelay {
    pub fn new(intake: Arc<TickIntake>, port: u16) -> Arc<Self> {
        Arc::new(Self { intake, port })
    }

    /// Accept loop; runs for the life of the process.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind relay on port {}", self.port))?;
        info!(port = self.port, "tick relay listening");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("relay accept failed")?;
            let rx = self.intake.subscribe();
            tokio::spawn(async move {
                match accept_async(stream).await {
                    Ok(ws) => {
                        info!(peer = %peer, "relay client connected");
                        if let Err(e) = serve_client(ws, rx).await {
                            debug!(peer = %peer, error = %e, "relay client disconnected");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "relay handshake failed");
                    }
                }
            });
        }
    }
}

async fn serve_client(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut rx: broadcast::Receiver<crate::market::Tick>,
) -> Result<()> {
    loop {
        match rx.recv().await {
            Ok(tick) => {
                let payload =
                    serde_json::to_string(&tick).context("failed to serialise tick")?;
                ws.send(Message::Text(payload))
                    .await
                    .context("relay send failed")?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay client lagged tick fan-out");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for TickRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickRelay").field("port", &self.port).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::tests::tick;
    use futures_util::StreamExt;
    use rust_decimal_macros::dec;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn relay_broadcasts_accepted_ticks_to_clients() {
        let intake = Arc::new(TickIntake::new(2_000, 60_000, 64));

        // Bind on an ephemeral port by probing one first.
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let relay = TickRelay::new(intake.clone(), port);
        tokio::spawn(relay.run());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("relay should accept");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(intake.handle_tick(tick("SBIN", dec!(500.00), 1_000)));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .expect("message within deadline")
            .expect("stream open")
            .expect("no transport error");
        let payload: serde_json::Value =
            serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(payload["symbol"], "SBIN");
        assert_eq!(payload["last_price"], "500.00");
    }
}
