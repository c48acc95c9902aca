// =============================================================================
// Mock broker — deterministic in-memory adapter for tests and dry runs
// =============================================================================
//
// Behaves like a compliant broker with scriptable outcomes: place results can
// be queued per call, order statuses flipped at will, ticks injected by hand.
// Everything the engine observes goes through the same BrokerPort surface the
// real adapters implement.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{
    map_broker_status, BrokerCredentials, BrokerError, BrokerHolding, BrokerPort, BrokerPosition,
    BrokerResult, Funds, InstrumentRecord, OrderChange, OrderRequest, OrderStatusReport,
    PlacedOrder, SessionToken, TickSender,
};
use crate::models::Candle;
use crate::types::{now_ms, BrokerKind, Timeframe};

#[derive(Default)]
struct MockState {
    placed: Vec<OrderRequest>,
    scripted_place: VecDeque<BrokerResult<PlacedOrder>>,
    orders: HashMap<String, OrderStatusReport>,
    order_seq: u64,
    ltp: HashMap<String, Decimal>,
    candles: Vec<Candle>,
    instruments: Vec<InstrumentRecord>,
    tick_sender: Option<TickSender>,
    funds: Option<Funds>,
}

pub struct MockBroker {
    state: Mutex<MockState>,
    can_place: AtomicBool,
    connected: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            can_place: AtomicBool::new(true),
            connected: AtomicBool::new(true),
        })
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Queue the outcome of the next `place_order` call.
    pub fn script_place_result(&self, result: BrokerResult<PlacedOrder>) {
        self.state.lock().scripted_place.push_back(result);
    }

    /// Flip the broker-side status of an order (as the exchange would).
    pub fn set_order_status(
        &self,
        order_id: &str,
        raw_status: &str,
        filled_qty: i64,
        avg_price: Option<Decimal>,
    ) {
        let mut state = self.state.lock();
        if let Some(report) = state.orders.get_mut(order_id) {
            report.raw_status = raw_status.to_string();
            report.status = map_broker_status(raw_status);
            report.filled_qty = filled_qty;
            report.avg_price = avg_price;
        }
    }

    pub fn set_order_status_message(&self, order_id: &str, message: &str) {
        let mut state = self.state.lock();
        if let Some(report) = state.orders.get_mut(order_id) {
            report.status_message = Some(message.to_string());
        }
    }

    pub fn set_ltp(&self, symbol: &str, price: Decimal) {
        self.state.lock().ltp.insert(symbol.to_string(), price);
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.state.lock().candles = candles;
    }

    pub fn set_instruments(&self, instruments: Vec<InstrumentRecord>) {
        self.state.lock().instruments = instruments;
    }

    pub fn set_funds(&self, funds: Funds) {
        self.state.lock().funds = Some(funds);
    }

    pub fn set_can_place(&self, allowed: bool) {
        self.can_place.store(allowed, Ordering::Relaxed);
    }

    /// All order requests the engine has sent, in order.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().placed.clone()
    }

    /// How many broker-side orders carry the given tag.
    pub fn orders_with_tag(&self, tag: &str) -> usize {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.tag.as_deref() == Some(tag))
            .count()
    }

    /// Inject a tick into the subscribed listener, if any.
    pub fn push_tick(&self, tick: crate::market::Tick) -> bool {
        let state = self.state.lock();
        match &state.tick_sender {
            Some(sender) => sender.try_send(tick).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Mock
    }

    async fn connect(&self, _credentials: &BrokerCredentials) -> BrokerResult<SessionToken> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(SessionToken {
            access_token: "mock-token".into(),
            refresh_token: Some("mock-refresh".into()),
            expires_at: now_ms() + 8 * 3600 * 1000,
        })
    }

    fn set_access_token(&self, _token: &str) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn can_place_orders(&self) -> bool {
        self.can_place.load(Ordering::Relaxed) && self.connected.load(Ordering::Relaxed)
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<PlacedOrder> {
        let mut state = self.state.lock();
        state.placed.push(request.clone());

        if let Some(result) = state.scripted_place.pop_front() {
            if let Ok(placed) = &result {
                state.orders.insert(
                    placed.order_id.clone(),
                    OrderStatusReport {
                        order_id: placed.order_id.clone(),
                        status: map_broker_status("OPEN"),
                        raw_status: "OPEN".into(),
                        status_message: None,
                        filled_qty: 0,
                        avg_price: None,
                        tag: Some(request.tag.clone()),
                        symbol: request.symbol.clone(),
                    },
                );
            }
            return result;
        }

        state.order_seq += 1;
        let order_id = format!("MOCK-{}", state.order_seq);
        state.orders.insert(
            order_id.clone(),
            OrderStatusReport {
                order_id: order_id.clone(),
                status: map_broker_status("OPEN"),
                raw_status: "OPEN".into(),
                status_message: None,
                filled_qty: 0,
                avg_price: None,
                tag: Some(request.tag.clone()),
                symbol: request.symbol.clone(),
            },
        );
        Ok(PlacedOrder { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        _change: &OrderChange,
    ) -> BrokerResult<PlacedOrder> {
        let state = self.state.lock();
        if state.orders.contains_key(order_id) {
            Ok(PlacedOrder {
                order_id: order_id.to_string(),
            })
        } else {
            Err(BrokerError::InvalidOrder(format!(
                "unknown order {order_id}"
            )))
        }
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(report) => {
                report.raw_status = "CANCELLED".into();
                report.status = map_broker_status("CANCELLED");
                Ok(())
            }
            None => Err(BrokerError::InvalidOrder(format!(
                "unknown order {order_id}"
            ))),
        }
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderStatusReport> {
        self.state
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidOrder(format!("unknown order {order_id}")))
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>> {
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .filter(|o| {
                matches!(
                    o.status,
                    crate::types::BrokerOrderState::Pending | crate::types::BrokerOrderState::Placed
                )
            })
            .cloned()
            .collect())
    }

    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(Vec::new())
    }

    async fn list_holdings(&self) -> BrokerResult<Vec<BrokerHolding>> {
        Ok(Vec::new())
    }

    async fn get_funds(&self) -> BrokerResult<Funds> {
        Ok(self.state.lock().funds.clone().unwrap_or(Funds {
            available: Decimal::new(100_000_00, 2),
            utilised: Decimal::ZERO,
        }))
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        self.state
            .lock()
            .ltp
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Connection(format!("no LTP for {symbol}")))
    }

    async fn subscribe_ticks(
        &self,
        _symbols: &[String],
        listener: TickSender,
    ) -> BrokerResult<()> {
        self.state.lock().tick_sender = Some(listener);
        Ok(())
    }

    async fn unsubscribe_ticks(&self, _symbols: &[String]) -> BrokerResult<()> {
        self.state.lock().tick_sender = None;
        Ok(())
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> BrokerResult<Vec<Candle>> {
        Ok(self
            .state
            .lock()
            .candles
            .iter()
            .filter(|c| {
                c.symbol == symbol
                    && c.timeframe == timeframe
                    && c.open_time >= from
                    && c.open_time < to
            })
            .cloned()
            .collect())
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        Ok(self.state.lock().instruments.clone())
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockBroker")
            .field("placed", &state.placed.len())
            .field("orders", &state.orders.len())
            .finish()
    }
}
