// =============================================================================
// Instrument master refresh
// =============================================================================
//
// Daily task: pull each broker's instrument dump, normalize into one record
// per (exchange, trading_symbol), and merge the broker-specific token payload
// into the stored mapping JSON.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::broker::BrokerPort;
use crate::models::Instrument;
use crate::store::Store;
use crate::types::now_ms;

pub struct InstrumentService {
    store: Arc<Store>,
}

impl InstrumentService {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Refresh the master from one broker's dump. Returns how many records
    /// were written.
    pub async fn refresh_from(&self, adapter: &Arc<dyn BrokerPort>) -> Result<usize> {
        let broker = adapter.kind();
        let records = match adapter.get_instruments().await {
            Ok(records) => records,
            Err(e) => {
                warn!(broker = %broker, error = %e, "instrument dump fetch failed");
                return Ok(0);
            }
        };

        let mut written = 0usize;
        for record in records {
            if record.trading_symbol.is_empty() {
                continue;
            }
            // Merge this broker's token into any existing mapping.
            let mut tokens = self
                .store
                .find_instrument(&record.exchange, &record.trading_symbol)?
                .map(|existing| existing.broker_tokens)
                .unwrap_or_else(|| serde_json::json!({}));
            if let Some(map) = tokens.as_object_mut() {
                map.insert(broker.as_str().to_string(), record.broker_token.clone());
            }

            let now = now_ms();
            self.store.upsert_instrument(&Instrument {
                id: format!("{}:{}", record.exchange, record.trading_symbol),
                exchange: record.exchange,
                trading_symbol: record.trading_symbol,
                name: record.name,
                broker_tokens: tokens,
                lot_size: record.lot_size,
                tick_size: record.tick_size,
                created_at: now,
                updated_at: now,
                version: 1,
            })?;
            written += 1;
        }

        info!(broker = %broker, written, "instrument master refreshed");
        Ok(written)
    }
}

impl std::fmt::Debug for InstrumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentService").finish()
    }
}
