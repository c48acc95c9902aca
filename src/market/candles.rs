// =============================================================================
// Candle builder — aggregates ticks into per-timeframe candles
// =============================================================================
//
// One in-progress candle per (symbol, timeframe) lives in memory. A candle
// finalizes when a tick crosses its bucket boundary, or when the periodic
// finalizer notices the bucket has ended with no tick arriving. Finalized
// candles are appended to the store (idempotently) and announced as
// CANDLE_FINALIZED events.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::Tick;
use crate::broker::BrokerPort;
use crate::events::{EngineEvent, EventBus};
use crate::models::Candle;
use crate::store::Store;
use crate::types::Timeframe;

#[derive(Debug, Clone)]
struct WorkingCandle {
    open_time: i64,
    end_time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: i64,
}

impl WorkingCandle {
    fn start(tf: Timeframe, tick: &Tick) -> Self {
        let open_time = tf.bucket_start_ms(tick.broker_ts);
        Self {
            open_time,
            end_time: tf.bucket_end_ms(tick.broker_ts),
            open: tick.last_price,
            high: tick.last_price,
            low: tick.last_price,
            close: tick.last_price,
            volume: tick.volume,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        if tick.last_price > self.high {
            self.high = tick.last_price;
        }
        if tick.last_price < self.low {
            self.low = tick.last_price;
        }
        self.close = tick.last_price;
        self.volume += tick.volume;
    }

    fn into_candle(self, symbol: &str, tf: Timeframe) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe: tf,
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

pub struct CandleBuilder {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    in_progress: Mutex<HashMap<(String, Timeframe), WorkingCandle>>,
}

impl CandleBuilder {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one tick through every timeframe. Returns the candles this tick
    /// finalized (usually none).
    pub fn on_tick(&self, tick: &Tick) -> Vec<Candle> {
        let mut finalized = Vec::new();
        let mut map = self.in_progress.lock();

        for tf in Timeframe::ALL {
            let key = (tick.symbol.clone(), tf);
            let rolls = map.get(&key).map(|w| tick.broker_ts >= w.end_time);
            match rolls {
                None => {
                    map.insert(key, WorkingCandle::start(tf, tick));
                }
                Some(true) => {
                    // Boundary crossed: close the old bucket, start the new.
                    if let Some(done) = map.remove(&key) {
                        finalized.push(done.into_candle(&tick.symbol, tf));
                    }
                    map.insert(key, WorkingCandle::start(tf, tick));
                }
                Some(false) => {
                    if let Some(working) = map.get_mut(&key) {
                        working.absorb(tick);
                    }
                }
            }
        }
        drop(map);

        for candle in &finalized {
            self.commit(candle);
        }
        finalized
    }

    /// Periodic sweep: finalize any in-progress candle whose bucket ended
    /// without a boundary-crossing tick.
    pub fn finalize_due(&self, now: i64) -> Vec<Candle> {
        let mut due = Vec::new();
        {
            let mut map = self.in_progress.lock();
            let expired: Vec<(String, Timeframe)> = map
                .iter()
                .filter(|(_, w)| now >= w.end_time)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(working) = map.remove(&key) {
                    due.push(working.into_candle(&key.0, key.1));
                }
            }
        }
        for candle in &due {
            self.commit(candle);
        }
        due
    }

    fn commit(&self, candle: &Candle) {
        match self.store.insert_candle(candle) {
            Ok(true) => {
                debug!(
                    symbol = %candle.symbol,
                    timeframe = %candle.timeframe,
                    open_time = candle.open_time,
                    close = %candle.close,
                    "candle finalized"
                );
                self.bus.publish(EngineEvent::CandleFinalized {
                    symbol: candle.symbol.clone(),
                    timeframe: candle.timeframe.as_str().to_string(),
                    open_time: candle.open_time,
                });
            }
            Ok(false) => {
                // Already stored by a previous run; nothing to announce.
                debug!(
                    symbol = %candle.symbol,
                    timeframe = %candle.timeframe,
                    open_time = candle.open_time,
                    "candle already persisted"
                );
            }
            Err(e) => {
                warn!(error = %e, symbol = %candle.symbol, "failed to persist candle");
                self.bus.push_error("CONNECTION", format!("candle persist: {e}"));
            }
        }
    }

    /// Listener task: consume the intake fan-out until the engine stops.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<Tick>) {
        info!("candle builder listening for ticks");
        loop {
            match rx.recv().await {
                Ok(tick) => {
                    self.on_tick(&tick);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "candle builder lagged tick fan-out");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("tick fan-out closed; candle builder stopping");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for CandleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleBuilder")
            .field("in_progress", &self.in_progress.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

/// Fills storage gaps from broker history and guarantees a minimum lookback
/// per (symbol, timeframe) at startup.
pub struct HistoryBackfiller {
    store: Arc<Store>,
    adapter: Arc<dyn BrokerPort>,
}

impl HistoryBackfiller {
    pub fn new(store: Arc<Store>, adapter: Arc<dyn BrokerPort>) -> Self {
        Self { store, adapter }
    }

    /// Fetch and store the window between the latest stored candle and now.
    pub async fn backfill_gap(&self, symbol: &str, tf: Timeframe, now: i64) -> Result<usize> {
        let current_bucket = tf.bucket_start_ms(now);
        let from = match self.store.latest_candle(symbol, tf)? {
            Some(latest) => latest.open_time + tf.duration_secs() * 1000,
            None => current_bucket - (tf.duration_secs() * 1000),
        };
        if from >= current_bucket {
            return Ok(0);
        }

        let fetched = self
            .adapter
            .get_historical_candles(symbol, tf, from, current_bucket)
            .await?;
        let mut stored = 0usize;
        for candle in &fetched {
            if self.store.insert_candle(candle)? {
                stored += 1;
            }
        }
        if stored > 0 {
            info!(symbol, timeframe = %tf, stored, "history gap backfilled");
        }
        Ok(stored)
    }

    /// Ensure at least `lookback` candles exist for the pair; fetches the
    /// missing head window when short.
    pub async fn ensure_lookback(
        &self,
        symbol: &str,
        tf: Timeframe,
        lookback: usize,
        now: i64,
    ) -> Result<usize> {
        let have = self.store.count_candles(symbol, tf)? as usize;
        if have >= lookback {
            return Ok(0);
        }
        let missing = lookback - have;
        let to = tf.bucket_start_ms(now);
        let from = to - (missing as i64) * tf.duration_secs() * 1000;

        let fetched = self
            .adapter
            .get_historical_candles(symbol, tf, from, to)
            .await?;
        let mut stored = 0usize;
        for candle in &fetched {
            if self.store.insert_candle(candle)? {
                stored += 1;
            }
        }
        info!(symbol, timeframe = %tf, have, lookback, stored, "lookback backfill complete");
        Ok(stored)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::tests::tick;
    use rust_decimal_macros::dec;

    fn builder() -> CandleBuilder {
        CandleBuilder::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn ticks_aggregate_into_ohlcv() {
        let cb = builder();
        let base = Timeframe::M1.bucket_start_ms(1_700_000_000_000);
        cb.on_tick(&tick("SBIN", dec!(500.00), base));
        cb.on_tick(&tick("SBIN", dec!(502.00), base + 10_000));
        cb.on_tick(&tick("SBIN", dec!(499.00), base + 20_000));
        cb.on_tick(&tick("SBIN", dec!(501.00), base + 30_000));

        // Boundary tick closes the 1m candle.
        let finalized = cb.on_tick(&tick("SBIN", dec!(503.00), base + 60_000));
        let one_min: Vec<_> = finalized
            .iter()
            .filter(|c| c.timeframe == Timeframe::M1)
            .collect();
        assert_eq!(one_min.len(), 1);
        let c = one_min[0];
        assert_eq!(c.open, dec!(500.00));
        assert_eq!(c.high, dec!(502.00));
        assert_eq!(c.low, dec!(499.00));
        assert_eq!(c.close, dec!(501.00));
        assert_eq!(c.volume, 400);
        assert_eq!(c.open_time, base);
    }

    #[test]
    fn finalizer_sweep_closes_quiet_buckets() {
        let cb = builder();
        let base = Timeframe::M1.bucket_start_ms(1_700_000_000_000);
        cb.on_tick(&tick("SBIN", dec!(500.00), base));

        // Nothing due while the bucket is open.
        assert!(cb.finalize_due(base + 30_000).is_empty());

        let due = cb.finalize_due(base + 61_000);
        assert!(due.iter().any(|c| c.timeframe == Timeframe::M1));
        // Swept candles are persisted.
        assert!(cb
            .store
            .latest_candle("SBIN", Timeframe::M1)
            .unwrap()
            .is_some());
    }

    #[test]
    fn finalized_candles_are_persisted_and_announced() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let cb = CandleBuilder::new(store.clone(), bus);

        let base = Timeframe::M1.bucket_start_ms(1_700_000_000_000);
        cb.on_tick(&tick("SBIN", dec!(500.00), base));
        cb.on_tick(&tick("SBIN", dec!(501.00), base + 60_000));

        assert_eq!(store.count_candles("SBIN", Timeframe::M1).unwrap(), 1);
        match rx.try_recv().unwrap() {
            EngineEvent::CandleFinalized { symbol, timeframe, open_time } => {
                assert_eq!(symbol, "SBIN");
                assert_eq!(timeframe, "1m");
                assert_eq!(open_time, base);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn all_timeframes_carry_working_candles() {
        let cb = builder();
        cb.on_tick(&tick("SBIN", dec!(500.00), 1_700_000_000_000));
        assert_eq!(cb.in_progress.lock().len(), Timeframe::ALL.len());
    }
}
