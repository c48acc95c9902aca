// =============================================================================
// Trade Coordinator — the single writer for Trade state
// =============================================================================
//
// Every status-changing operation routes through a per-trade partition (hash
// of trade id), so updates to one trade are serialised while different
// trades run in parallel. All other components read trades through the
// active-trade index and mutate only by calling in here.
//
// Status machine: CREATED -> PENDING -> OPEN -> EXITING -> CLOSED, with
// REJECTED / TIMEOUT / CANCELLED as terminal side branches. An illegal
// transition is refused, logged, and leaves state untouched.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::models::{log_return, round_price, Signal, Trade, TradeIntent};
use crate::partitions::PartitionPool;
use crate::store::Store;
use crate::types::{exchange_offset, now_ms, Direction, ExitReason, TradeStatus};

pub struct TradeCoordinator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    config: Arc<EngineConfig>,
    partitions: PartitionPool,
    /// Active-trade index: symbol -> trade_id -> latest Trade value. Holds
    /// OPEN and EXITING trades.
    index: RwLock<HashMap<String, HashMap<String, Trade>>>,
}

impl TradeCoordinator {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, config: Arc<EngineConfig>) -> Arc<Self> {
        let partitions = PartitionPool::new("trades", config.partitions);
        Arc::new(Self {
            store,
            bus,
            config,
            partitions,
            index: RwLock::new(HashMap::new()),
        })
    }

    /// The backing store, for collaborators constructed around the
    /// coordinator.
    pub fn store_handle(&self) -> Arc<Store> {
        self.store.clone()
    }

    // -------------------------------------------------------------------------
    // Index
    // -------------------------------------------------------------------------

    /// Rebuild the in-memory index from persistent state. Called by the
    /// startup gate before any component runs.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut fresh: HashMap<String, HashMap<String, Trade>> = HashMap::new();
        let mut count = 0usize;
        for status in [TradeStatus::Open, TradeStatus::Exiting] {
            for trade in self.store.list_trades_by_status(status)? {
                count += 1;
                fresh
                    .entry(trade.symbol.clone())
                    .or_default()
                    .insert(trade.id.clone(), trade);
            }
        }
        *self.index.write() = fresh;
        info!(active_trades = count, "active trade index rebuilt");
        Ok(count)
    }

    /// OPEN trades for a symbol (EXITING trades are excluded from exit
    /// evaluation).
    pub fn open_trades_for(&self, symbol: &str) -> Vec<Trade> {
        self.index
            .read()
            .get(symbol)
            .map(|trades| {
                trades
                    .values()
                    .filter(|t| t.status == TradeStatus::Open)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_trade_count(&self) -> usize {
        self.index.read().values().map(|m| m.len()).sum()
    }

    pub fn symbols_with_active_trades(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    fn index_put(&self, trade: &Trade) {
        self.index
            .write()
            .entry(trade.symbol.clone())
            .or_default()
            .insert(trade.id.clone(), trade.clone());
    }

    fn index_remove(&self, trade: &Trade) {
        let mut index = self.index.write();
        let emptied = index
            .get_mut(&trade.symbol)
            .map(|per_symbol| {
                per_symbol.remove(&trade.id);
                per_symbol.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            index.remove(&trade.symbol);
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Create-and-persist the trade row for an approved intent, with the
    /// entry snapshot from the signal and exit targets derived from the
    /// effective floor/ceiling and configured R multiples.
    ///
    /// Idempotent on `intent_id`: if a previous run already created the
    /// trade, that row is returned instead.
    pub async fn create_trade(
        self: &Arc<Self>,
        intent: &TradeIntent,
        signal: &Signal,
        portfolio_id: &str,
    ) -> Result<Trade> {
        let this = self.clone();
        let intent = intent.clone();
        let signal = signal.clone();
        let portfolio_id = portfolio_id.to_string();
        // Creation is keyed on the intent so a racing duplicate executor
        // serialises against itself.
        let key = format!("create:{}", intent.intent_id);
        self.partitions
            .run_on(&key, async move { this.apply_create(&intent, &signal, &portfolio_id) })
            .await
    }

    fn apply_create(
        &self,
        intent: &TradeIntent,
        signal: &Signal,
        portfolio_id: &str,
    ) -> Result<Trade> {
        if let Some(existing) = self.store.find_trade_by_intent(&intent.intent_id)? {
            debug!(
                trade_id = %existing.id,
                intent_id = %intent.intent_id,
                "trade already exists for intent"
            );
            return Ok(existing);
        }

        let risk_per_share = (signal.ref_price - signal.effective_floor).abs();
        let project = |r: Decimal| -> Decimal {
            match signal.direction {
                Direction::Buy => round_price(signal.ref_price + risk_per_share * r),
                Direction::Sell => round_price(signal.ref_price - risk_per_share * r),
            }
        };
        let target_min_profit = project(self.config.min_profit_r);
        let target_price = project(self.config.target_r);
        let target_stretch = match signal.direction {
            Direction::Buy => signal.effective_ceiling.min(project(self.config.stretch_r)),
            Direction::Sell => signal.effective_ceiling.max(project(self.config.stretch_r)),
        };

        let now = now_ms();
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            portfolio_id: portfolio_id.to_string(),
            user_id: intent.user_id.clone(),
            broker_id: intent.broker_id.clone(),
            user_broker_id: intent.user_broker_id.clone(),
            signal_id: intent.signal_id.clone(),
            intent_id: intent.intent_id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            status: TradeStatus::Created,
            entry_price: signal.ref_price,
            entry_qty: intent.calculated_qty,
            entry_value: intent.calculated_value,
            entry_at: None,
            zone: signal.zone.clone(),
            log_loss_floor: signal.effective_floor,
            max_log_loss: self.config.max_trade_log_loss,
            target_min_profit,
            target_price,
            target_stretch,
            target_primary: target_price,
            current_price: None,
            current_log_return: None,
            unrealized_pnl: None,
            trailing_active: false,
            trailing_highest_price: None,
            trailing_stop_price: None,
            exit_price: None,
            exit_at: None,
            exit_trigger: None,
            exit_order_id: None,
            realized_pnl: None,
            realized_log_return: None,
            holding_days: None,
            broker_order_id: None,
            client_order_id: intent.intent_id.clone(),
            last_broker_update_at: now,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        };
        self.store.insert_trade(&trade)?;
        info!(
            trade_id = %trade.id,
            intent_id = %trade.intent_id,
            symbol = %trade.symbol,
            qty = trade.entry_qty,
            "trade created"
        );
        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    async fn transition<F>(self: &Arc<Self>, trade_id: &str, label: &'static str, f: F) -> Result<Trade>
    where
        F: FnOnce(&TradeCoordinator, &mut Trade) -> Result<()> + Send + 'static,
    {
        let this = self.clone();
        let trade_id = trade_id.to_string();
        self.partitions
            .run_on(&trade_id.clone(), async move {
                let mut trade = this
                    .store
                    .get_trade(&trade_id)?
                    .with_context(|| format!("unknown trade {trade_id}"))?;
                f(&this, &mut trade)?;
                this.store.persist_trade(&mut trade)?;
                this.sync_index(&trade);
                debug!(trade_id = %trade.id, status = %trade.status, op = label, "trade transition");
                Ok(trade)
            })
            .await
    }

    fn sync_index(&self, trade: &Trade) {
        match trade.status {
            TradeStatus::Open | TradeStatus::Exiting => self.index_put(trade),
            _ => self.index_remove(trade),
        }
    }

    fn require_status(trade: &Trade, allowed: &[TradeStatus]) -> Result<()> {
        if !allowed.contains(&trade.status) {
            bail!(
                "illegal transition for trade {} from {}",
                trade.id,
                trade.status
            );
        }
        Ok(())
    }

    /// CREATED -> PENDING once the broker accepted the order.
    pub async fn mark_pending(
        self: &Arc<Self>,
        trade_id: &str,
        broker_order_id: &str,
    ) -> Result<Trade> {
        let broker_order_id = broker_order_id.to_string();
        self.transition(trade_id, "mark_pending", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Created])?;
            trade.status = TradeStatus::Pending;
            trade.broker_order_id = Some(broker_order_id);
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// Terminal rejection with the broker's code/message preserved.
    pub async fn mark_rejected(
        self: &Arc<Self>,
        trade_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<Trade> {
        let code = error_code.to_string();
        let message = error_message.to_string();
        let trade = self
            .transition(trade_id, "mark_rejected", {
                let code = code.clone();
                let message = message.clone();
                move |_, trade| {
                    Self::require_status(
                        trade,
                        &[TradeStatus::Created, TradeStatus::Pending],
                    )?;
                    trade.status = TradeStatus::Rejected;
                    trade.error_code = Some(code);
                    trade.error_message = Some(message);
                    trade.last_broker_update_at = now_ms();
                    Ok(())
                }
            })
            .await?;
        self.bus
            .push_error("BROKER_REJECTED", format!("trade {trade_id}: [{code}] {message}"));
        Ok(trade)
    }

    /// PENDING -> TIMEOUT when the broker never answered inside the window.
    pub async fn mark_timeout(self: &Arc<Self>, trade_id: &str) -> Result<Trade> {
        let trade = self
            .transition(trade_id, "mark_timeout", move |_, trade| {
                Self::require_status(trade, &[TradeStatus::Pending])?;
                trade.status = TradeStatus::Timeout;
                trade.last_broker_update_at = now_ms();
                Ok(())
            })
            .await?;
        self.bus.publish(EngineEvent::OrderTimeout {
            trade_id: trade_id.to_string(),
        });
        Ok(trade)
    }

    /// PENDING -> CANCELLED per broker truth.
    pub async fn mark_cancelled(self: &Arc<Self>, trade_id: &str) -> Result<Trade> {
        self.transition(trade_id, "mark_cancelled", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Created, TradeStatus::Pending])?;
            trade.status = TradeStatus::Cancelled;
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// PENDING -> OPEN on broker fill; entry snapshot adopts broker truth.
    pub async fn open_on_fill(
        self: &Arc<Self>,
        trade_id: &str,
        avg_price: Decimal,
        filled_qty: i64,
    ) -> Result<Trade> {
        self.transition(trade_id, "open_on_fill", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Pending, TradeStatus::Created])?;
            trade.status = TradeStatus::Open;
            trade.entry_price = round_price(avg_price);
            if filled_qty > 0 {
                trade.entry_qty = filled_qty;
            }
            trade.entry_value =
                round_price(trade.entry_price * Decimal::from(trade.entry_qty));
            trade.entry_at = Some(now_ms());
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// OPEN -> EXITING once an exit order is working at the broker.
    pub async fn begin_exit(
        self: &Arc<Self>,
        trade_id: &str,
        exit_order_id: &str,
    ) -> Result<Trade> {
        let exit_order_id = exit_order_id.to_string();
        self.transition(trade_id, "begin_exit", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Open])?;
            trade.status = TradeStatus::Exiting;
            trade.exit_order_id = Some(exit_order_id);
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// EXITING -> OPEN when the exit order died (rejected, cancelled or
    /// timed out); exit evaluation resumes.
    pub async fn revert_exit(self: &Arc<Self>, trade_id: &str) -> Result<Trade> {
        self.transition(trade_id, "revert_exit", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Exiting])?;
            trade.status = TradeStatus::Open;
            trade.exit_order_id = None;
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// EXITING -> CLOSED on exit fill: realize PnL, log return and holding
    /// days, then drop the trade from the active index.
    pub async fn close_trade_on_exit_fill(
        self: &Arc<Self>,
        trade_id: &str,
        exit_price: Decimal,
        exit_qty: i64,
        exit_reason: ExitReason,
        filled_at: i64,
    ) -> Result<Trade> {
        self.transition(trade_id, "close_on_exit_fill", move |_, trade| {
            Self::require_status(trade, &[TradeStatus::Exiting, TradeStatus::Open])?;
            let exit_price = round_price(exit_price);
            let qty = if exit_qty > 0 { exit_qty } else { trade.entry_qty };
            let sign = Decimal::from(trade.direction.sign());

            trade.status = TradeStatus::Closed;
            trade.exit_price = Some(exit_price);
            trade.exit_at = Some(filled_at);
            trade.exit_trigger = Some(exit_reason);
            trade.realized_pnl = Some(round_price(
                (exit_price - trade.entry_price) * Decimal::from(qty) * sign,
            ));
            trade.realized_log_return =
                Some(log_return(trade.entry_price, exit_price) * sign);
            trade.holding_days = Some(holding_days(trade.entry_at, filled_at));
            trade.current_price = Some(exit_price);
            trade.unrealized_pnl = Some(Decimal::ZERO);
            trade.last_broker_update_at = now_ms();
            Ok(())
        })
        .await
    }

    /// Run arbitrary work on the trade's partition. Exit-intent creation
    /// rides on this so its check-then-insert is serialised with every other
    /// mutation of the same trade.
    pub async fn run_serialized<F, T>(&self, trade_id: &str, fut: F) -> T
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.partitions.run_on(trade_id, fut).await
    }

    /// Heartbeat without state change (reconciler's "still pending" path).
    pub fn touch_heartbeat(&self, trade_id: &str) -> Result<()> {
        self.store.touch_trade_heartbeat(trade_id, now_ms())?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Live updates (tick-driven)
    // -------------------------------------------------------------------------

    /// Refresh live fields and the trailing stop for one open trade. Live
    /// price fields stay in memory; a store write happens only when the
    /// trailing state actually changed.
    pub async fn update_live(
        self: &Arc<Self>,
        trade_id: &str,
        price: Decimal,
    ) -> Result<Option<Trade>> {
        let this = self.clone();
        let trade_id = trade_id.to_string();
        self.partitions
            .run_on(&trade_id.clone(), async move {
                let cached = {
                    let index = this.index.read();
                    index
                        .values()
                        .find_map(|per_symbol| per_symbol.get(&trade_id))
                        .cloned()
                };
                let Some(mut trade) = cached else {
                    return Ok(None);
                };
                if trade.status != TradeStatus::Open {
                    return Ok(None);
                }

                let sign = Decimal::from(trade.direction.sign());
                trade.current_price = Some(price);
                trade.current_log_return =
                    Some(log_return(trade.entry_price, price) * sign);
                trade.unrealized_pnl = Some(round_price(
                    (price - trade.entry_price) * Decimal::from(trade.entry_qty) * sign,
                ));

                let trailing_changed = this.update_trailing(&mut trade, price);
                if trailing_changed {
                    // Re-read for a current version before persisting.
                    let mut stored = this
                        .store
                        .get_trade(&trade.id)?
                        .with_context(|| format!("unknown trade {}", trade.id))?;
                    stored.trailing_active = trade.trailing_active;
                    stored.trailing_highest_price = trade.trailing_highest_price;
                    stored.trailing_stop_price = trade.trailing_stop_price;
                    this.store.persist_trade(&mut stored)?;
                    trade.version = stored.version;
                    trade.updated_at = stored.updated_at;
                }

                this.index_put(&trade);
                Ok(Some(trade))
            })
            .await
    }

    /// Trailing stop maintenance. For longs: activate when price first moves
    /// up by the activation percentage, track the highest price
    /// monotonically, and hold `stop = highest * (1 - distance)`. Shorts are
    /// symmetric (the "highest" slot tracks the lowest price).
    fn update_trailing(&self, trade: &mut Trade, price: Decimal) -> bool {
        let activation = self.config.trailing_activation_pct;
        let distance = self.config.trailing_distance_pct;
        let one = Decimal::ONE;
        let mut changed = false;

        match trade.direction {
            Direction::Buy => {
                if !trade.trailing_active
                    && price >= trade.entry_price * (one + activation)
                {
                    trade.trailing_active = true;
                    trade.trailing_highest_price = Some(price);
                    trade.trailing_stop_price = Some(round_price(price * (one - distance)));
                    changed = true;
                } else if trade.trailing_active {
                    let highest = trade.trailing_highest_price.unwrap_or(price);
                    if price > highest {
                        trade.trailing_highest_price = Some(price);
                        trade.trailing_stop_price =
                            Some(round_price(price * (one - distance)));
                        changed = true;
                    }
                }
            }
            Direction::Sell => {
                if !trade.trailing_active
                    && price <= trade.entry_price * (one - activation)
                {
                    trade.trailing_active = true;
                    trade.trailing_highest_price = Some(price);
                    trade.trailing_stop_price = Some(round_price(price * (one + distance)));
                    changed = true;
                } else if trade.trailing_active {
                    let lowest = trade.trailing_highest_price.unwrap_or(price);
                    if price < lowest {
                        trade.trailing_highest_price = Some(price);
                        trade.trailing_stop_price =
                            Some(round_price(price * (one + distance)));
                        changed = true;
                    }
                }
            }
        }
        if changed {
            debug!(
                trade_id = %trade.id,
                highest = ?trade.trailing_highest_price,
                stop = ?trade.trailing_stop_price,
                "trailing stop updated"
            );
        }
        changed
    }
}

/// Calendar-day difference between entry and exit in the exchange timezone.
fn holding_days(entry_at: Option<i64>, exit_at: i64) -> i64 {
    let Some(entry_at) = entry_at else {
        return 0;
    };
    let tz = exchange_offset();
    let entry = DateTime::<Utc>::from_timestamp_millis(entry_at)
        .map(|dt| dt.with_timezone(&tz).date_naive());
    let exit = DateTime::<Utc>::from_timestamp_millis(exit_at)
        .map(|dt| dt.with_timezone(&tz).date_naive());
    match (entry, exit) {
        (Some(entry), Some(exit)) => (exit - entry).num_days(),
        _ => 0,
    }
}

impl std::fmt::Debug for TradeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeCoordinator")
            .field("active_trades", &self.active_trade_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::validation::tests::test_signal;
    use rust_decimal_macros::dec;

    pub(crate) fn coordinator() -> Arc<TradeCoordinator> {
        TradeCoordinator::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
            Arc::new(EngineConfig::default()),
        )
    }

    pub(crate) fn test_intent(intent_id: &str) -> TradeIntent {
        use crate::types::{IntentStatus, OrderType, ProductType};
        TradeIntent {
            intent_id: intent_id.into(),
            signal_id: "s1".into(),
            user_id: "u1".into(),
            broker_id: "b1".into(),
            user_broker_id: "ub1".into(),
            validation_passed: true,
            errors: Vec::new(),
            calculated_qty: 20,
            calculated_value: dec!(10000.00),
            order_type: OrderType::Market,
            limit_price: None,
            product_type: ProductType::Cnc,
            log_impact: dec!(0.020000),
            portfolio_exposure_after: dec!(10000.00),
            status: IntentStatus::Approved,
            created_at: now_ms(),
            updated_at: now_ms(),
            version: 1,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_on_intent() {
        let coord = coordinator();
        let t1 = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        let t2 = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        assert_eq!(t1.id, t2.id);
        assert_eq!(t1.client_order_id, "i1");
        assert_eq!(t1.status, TradeStatus::Created);
    }

    #[tokio::test]
    async fn targets_derive_from_floor_and_ceiling() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        // risk/share = 500 - 490 = 10; min profit at 0.5R, target at 1R,
        // stretch 1.5R capped by the 520 ceiling.
        assert_eq!(trade.target_min_profit, dec!(505.00));
        assert_eq!(trade.target_price, dec!(510.00));
        assert_eq!(trade.target_stretch, dec!(515.00));
        assert_eq!(trade.target_primary, dec!(510.00));
    }

    #[tokio::test]
    async fn full_lifecycle_to_closed() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();

        let trade = coord.mark_pending(&trade.id, "BRK1").await.unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.broker_order_id.as_deref(), Some("BRK1"));

        let trade = coord
            .open_on_fill(&trade.id, dec!(502.50), 20)
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_price, dec!(502.50));
        assert_eq!(coord.open_trades_for("SBIN").len(), 1);

        let trade = coord.begin_exit(&trade.id, "EXIT1").await.unwrap();
        assert_eq!(trade.status, TradeStatus::Exiting);
        // Exiting trades leave exit evaluation.
        assert!(coord.open_trades_for("SBIN").is_empty());

        let trade = coord
            .close_trade_on_exit_fill(
                &trade.id,
                dec!(518.80),
                20,
                ExitReason::TargetHit,
                now_ms(),
            )
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.realized_pnl, Some(dec!(326.00)));
        assert_eq!(trade.holding_days, Some(0));
        assert_eq!(coord.active_trade_count(), 0);
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        // CREATED cannot close.
        assert!(coord
            .close_trade_on_exit_fill(
                &trade.id,
                dec!(510.00),
                20,
                ExitReason::TargetHit,
                now_ms()
            )
            .await
            .is_err());
        // State is untouched.
        let loaded = coord.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Created);
        assert!(loaded.exit_price.is_none());
    }

    #[tokio::test]
    async fn concurrent_transitions_serialise_per_trade() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        coord.mark_pending(&trade.id, "BRK1").await.unwrap();

        // Two racing reconciler decisions: only one can win; the loser is
        // refused by the status guard, never corrupting state.
        let c1 = coord.clone();
        let id1 = trade.id.clone();
        let fill = tokio::spawn(async move { c1.open_on_fill(&id1, dec!(502.50), 20).await });
        let c2 = coord.clone();
        let id2 = trade.id.clone();
        let timeout = tokio::spawn(async move { c2.mark_timeout(&id2).await });

        let results = [fill.await.unwrap().is_ok(), timeout.await.unwrap().is_ok()];
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);

        let loaded = coord.store.get_trade(&trade.id).unwrap().unwrap();
        assert!(matches!(
            loaded.status,
            TradeStatus::Open | TradeStatus::Timeout
        ));
        // No impossible composite state: OPEN has an entry timestamp,
        // TIMEOUT has none of the exit fields.
        if loaded.status == TradeStatus::Open {
            assert!(loaded.entry_at.is_some());
        } else {
            assert!(loaded.exit_price.is_none());
        }
    }

    #[tokio::test]
    async fn trailing_stop_monotonic_and_exact() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        coord.mark_pending(&trade.id, "BRK1").await.unwrap();
        coord
            .open_on_fill(&trade.id, dec!(100.00), 20)
            .await
            .unwrap();

        // Below activation: nothing.
        let t = coord
            .update_live(&trade.id, dec!(101.00))
            .await
            .unwrap()
            .unwrap();
        assert!(!t.trailing_active);

        // Activation at +2%.
        let t = coord
            .update_live(&trade.id, dec!(102.00))
            .await
            .unwrap()
            .unwrap();
        assert!(t.trailing_active);
        assert_eq!(t.trailing_highest_price, Some(dec!(102.00)));

        // Ascend to 110: highest tracks monotonically, stop = highest * 0.97.
        for price in [103, 104, 105, 106, 107, 108, 109, 110] {
            coord
                .update_live(&trade.id, Decimal::from(price))
                .await
                .unwrap();
        }
        let t = coord
            .update_live(&trade.id, dec!(108.00))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.trailing_highest_price, Some(dec!(110)));
        assert_eq!(t.trailing_stop_price, Some(dec!(106.70)));

        // A pullback never lowers the highest.
        let t = coord
            .update_live(&trade.id, dec!(104.00))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.trailing_highest_price, Some(dec!(110)));
        assert_eq!(t.current_price, Some(dec!(104.00)));
    }

    #[tokio::test]
    async fn rejected_trade_leaves_index_untouched() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        coord
            .mark_rejected(&trade.id, "RMS:MARGIN_SHORTFALL", "insufficient margin")
            .await
            .unwrap();
        assert_eq!(coord.active_trade_count(), 0);
        let loaded = coord.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Rejected);
        assert_eq!(loaded.error_code.as_deref(), Some("RMS:MARGIN_SHORTFALL"));
        assert_eq!(
            loaded.error_message.as_deref(),
            Some("insufficient margin")
        );
    }

    #[tokio::test]
    async fn rebuild_index_restores_open_trades() {
        let coord = coordinator();
        let trade = coord
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        coord.mark_pending(&trade.id, "BRK1").await.unwrap();
        coord
            .open_on_fill(&trade.id, dec!(502.50), 20)
            .await
            .unwrap();

        // Simulate a restart: wipe the index and rebuild from the store.
        *coord.index.write() = HashMap::new();
        assert!(coord.open_trades_for("SBIN").is_empty());
        let restored = coord.rebuild_index().unwrap();
        assert_eq!(restored, 1);
        assert_eq!(coord.open_trades_for("SBIN").len(), 1);
    }
}
