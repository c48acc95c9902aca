// =============================================================================
// Tick intake — dedup, LTP cache, listener fan-out
// =============================================================================
//
// The ingest path never blocks on DB or broker work: adapters push parsed
// ticks into a bounded channel; the intake task dedupes, updates the LTP
// cache and republishes on a broadcast channel. Slow listeners lag and lose
// the oldest ticks (counted), they never stall ingest.
// =============================================================================

pub mod candles;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::types::now_ms;

/// One normalized market tick from a data broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub last_price: Decimal,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: i64,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    /// Broker-stamped time, epoch milliseconds.
    pub broker_ts: i64,
    /// Local arrival time, epoch milliseconds.
    pub received_at: i64,
}

// ---------------------------------------------------------------------------
// Two-window deduplicator
// ---------------------------------------------------------------------------

/// A tick is accepted iff its `(symbol, broker_ts)` has not been seen in the
/// short window AND no semantically identical tick (same symbol, price,
/// volume, bid, ask) is present in the long window.
pub struct TickDeduper {
    short_window_ms: i64,
    long_window_ms: i64,
    short_seen: HashMap<(String, i64), i64>,
    short_order: VecDeque<(i64, (String, i64))>,
    long_seen: HashMap<String, i64>,
    long_order: VecDeque<(i64, String)>,
}

impl TickDeduper {
    pub fn new(short_window_ms: i64, long_window_ms: i64) -> Self {
        Self {
            short_window_ms,
            long_window_ms,
            short_seen: HashMap::new(),
            short_order: VecDeque::new(),
            long_seen: HashMap::new(),
            long_order: VecDeque::new(),
        }
    }

    fn semantic_key(tick: &Tick) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            tick.symbol,
            tick.last_price,
            tick.volume,
            tick.bid.map(|d| d.to_string()).unwrap_or_default(),
            tick.ask.map(|d| d.to_string()).unwrap_or_default(),
        )
    }

    /// Check-and-record. Returns whether the tick should be processed.
    pub fn accept(&mut self, tick: &Tick, now: i64) -> bool {
        self.evict(now);

        let exact_key = (tick.symbol.clone(), tick.broker_ts);
        if self.short_seen.contains_key(&exact_key) {
            return false;
        }
        let semantic = Self::semantic_key(tick);
        if self.long_seen.contains_key(&semantic) {
            return false;
        }

        self.short_seen.insert(exact_key.clone(), now);
        self.short_order.push_back((now, exact_key));
        self.long_seen.insert(semantic.clone(), now);
        self.long_order.push_back((now, semantic));
        true
    }

    fn evict(&mut self, now: i64) {
        while let Some((ts, _)) = self.short_order.front() {
            if now - ts < self.short_window_ms {
                break;
            }
            let (_, key) = self.short_order.pop_front().expect("front checked");
            self.short_seen.remove(&key);
        }
        while let Some((ts, _)) = self.long_order.front() {
            if now - ts < self.long_window_ms {
                break;
            }
            let (_, key) = self.long_order.pop_front().expect("front checked");
            self.long_seen.remove(&key);
        }
    }
}

// ---------------------------------------------------------------------------
// LTP cache
// ---------------------------------------------------------------------------

/// Last-traded-price cache. Written by tick intake only; read by anyone.
pub struct LtpCache {
    prices: RwLock<HashMap<String, (Decimal, i64)>>,
}

impl LtpCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, symbol: &str, price: Decimal, ts: i64) {
        self.prices.write().insert(symbol.to_string(), (price, ts));
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.prices.read().get(symbol).map(|(p, _)| *p)
    }

    /// Milliseconds since the last update for `symbol`.
    pub fn age_ms(&self, symbol: &str, now: i64) -> Option<i64> {
        self.prices.read().get(symbol).map(|(_, ts)| now - ts)
    }

    /// Age of the freshest entry across all symbols; the watchdog's feed
    /// liveness signal.
    pub fn freshest_age_ms(&self, now: i64) -> Option<i64> {
        self.prices
            .read()
            .values()
            .map(|(_, ts)| now - ts)
            .min()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.prices.read().keys().cloned().collect()
    }
}

impl Default for LtpCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tick intake
// ---------------------------------------------------------------------------

/// Capacity of the adapter -> intake channel.
const INGEST_CAPACITY: usize = 8192;

pub struct TickIntake {
    deduper: Mutex<TickDeduper>,
    ltp: Arc<LtpCache>,
    fanout: broadcast::Sender<Tick>,
    accepted: AtomicU64,
    deduplicated: AtomicU64,
    ingest_dropped: Arc<AtomicU64>,
}

impl TickIntake {
    pub fn new(short_window_ms: i64, long_window_ms: i64, fanout_capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(fanout_capacity.max(16));
        Self {
            deduper: Mutex::new(TickDeduper::new(short_window_ms, long_window_ms)),
            ltp: Arc::new(LtpCache::new()),
            fanout,
            accepted: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            ingest_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ltp_cache(&self) -> Arc<LtpCache> {
        self.ltp.clone()
    }

    /// Subscribe a downstream listener. Lagging receivers skip the oldest
    /// ticks; the skip count surfaces in `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.fanout.subscribe()
    }

    /// The bounded sender handed to broker adapters, plus its drop counter.
    pub fn ingest_channel(self: &Arc<Self>) -> (mpsc::Sender<Tick>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(INGEST_CAPACITY);
        let intake = self.clone();
        tokio::spawn(async move {
            intake.run(rx).await;
        });
        (tx, self.ingest_dropped.clone())
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Tick>) {
        info!("tick intake started");
        while let Some(tick) = rx.recv().await {
            self.handle_tick(tick);
        }
        info!("tick intake channel closed");
    }

    /// Process one inbound tick; the synchronous core of the ingest path.
    pub fn handle_tick(&self, tick: Tick) -> bool {
        let now = now_ms();
        let accepted = self.deduper.lock().accept(&tick, now);
        if !accepted {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %tick.symbol, broker_ts = tick.broker_ts, "tick deduplicated");
            return false;
        }

        self.ltp.update(&tick.symbol, tick.last_price, tick.broker_ts);
        self.accepted.fetch_add(1, Ordering::Relaxed);

        // A send error only means no listener is currently subscribed.
        if self.fanout.send(tick).is_err() {
            warn!("tick accepted with no listeners attached");
        }
        true
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn deduplicated_count(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    pub fn ingest_dropped_count(&self) -> u64 {
        self.ingest_dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TickIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickIntake")
            .field("accepted", &self.accepted_count())
            .field("deduplicated", &self.deduplicated_count())
            .finish()
    }
}
