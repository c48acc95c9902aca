// =============================================================================
// Exit Signal Service — tick-driven evaluation of open trades
// =============================================================================
//
// On each tick, every open trade in that symbol gets its live fields and
// trailing stop refreshed through the trade coordinator, then the exit rules
// run in priority order: hard stop, trailing stop, target, time, risk
// breach. The first match raises an ExitIntent. Intent creation runs on the
// trade's partition, so a burst of ticks cannot double-raise for the same
// trade.
// =============================================================================

pub mod pipeline;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::market::Tick;
use crate::models::{ExitIntent, Trade};
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::{
    exchange_offset, now_ms, Direction, ExitIntentStatus, ExitReason, OrderType, ProductType,
};

/// Priority-ordered exit evaluation. Pure: no storage access, no clock reads
/// beyond the supplied `now`.
pub fn evaluate_exit(
    trade: &Trade,
    price: Decimal,
    now: i64,
    max_holding_days: i64,
    risk_breach: bool,
) -> Option<ExitReason> {
    let long = trade.direction == Direction::Buy;

    // 1. Hard stop at the max-log-loss floor.
    let floor_hit = if long {
        price <= trade.log_loss_floor
    } else {
        price >= trade.log_loss_floor
    };
    if floor_hit {
        return Some(ExitReason::StopLoss);
    }

    // 2. Trailing stop.
    if trade.trailing_active {
        if let Some(stop) = trade.trailing_stop_price {
            let crossed = if long { price <= stop } else { price >= stop };
            if crossed {
                return Some(ExitReason::TrailingStop);
            }
        }
    }

    // 3. Target / stretch.
    let target_hit = if long {
        price >= trade.target_primary || price >= trade.target_stretch
    } else {
        price <= trade.target_primary || price <= trade.target_stretch
    };
    if target_hit {
        return Some(ExitReason::TargetHit);
    }

    // 4. Time-based.
    if let Some(entry_at) = trade.entry_at {
        if holding_days_between(entry_at, now) >= max_holding_days {
            return Some(ExitReason::TimeBased);
        }
    }

    // 5. Portfolio / global risk breach.
    if risk_breach {
        return Some(ExitReason::RiskBreach);
    }

    None
}

fn holding_days_between(entry_at: i64, now: i64) -> i64 {
    let tz = exchange_offset();
    let entry = DateTime::<Utc>::from_timestamp_millis(entry_at)
        .map(|dt| dt.with_timezone(&tz).date_naive());
    let exit = DateTime::<Utc>::from_timestamp_millis(now)
        .map(|dt| dt.with_timezone(&tz).date_naive());
    match (entry, exit) {
        (Some(entry), Some(exit)) => (exit - entry).num_days(),
        _ => 0,
    }
}

pub struct ExitSignalService {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    coordinator: Arc<TradeCoordinator>,
}

impl ExitSignalService {
    pub fn new(
        store: Arc<Store>,
        config: Arc<EngineConfig>,
        coordinator: Arc<TradeCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            coordinator,
        })
    }

    /// Listener task on the tick fan-out.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<Tick>) {
        info!("exit signal service listening for ticks");
        loop {
            match rx.recv().await {
                Ok(tick) => {
                    if let Err(e) = self.on_tick(&tick).await {
                        warn!(symbol = %tick.symbol, error = %e, "exit evaluation failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "exit signal service lagged tick fan-out");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("tick fan-out closed; exit signal service stopping");
                    return;
                }
            }
        }
    }

    /// Evaluate every open trade in the tick's symbol. Returns the ids of
    /// any exit intents raised.
    pub async fn on_tick(&self, tick: &Tick) -> Result<Vec<String>> {
        let open = self.coordinator.open_trades_for(&tick.symbol);
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let mut raised = Vec::new();
        for trade in open {
            let Some(updated) = self
                .coordinator
                .update_live(&trade.id, tick.last_price)
                .await?
            else {
                continue;
            };

            let risk_breach = self.portfolio_risk_breached(&updated)?;
            let reason = evaluate_exit(
                &updated,
                tick.last_price,
                now_ms(),
                self.config.max_holding_days,
                risk_breach,
            );
            if let Some(reason) = reason {
                if let Some(intent_id) = self.raise_exit_intent(&updated, reason).await? {
                    raised.push(intent_id);
                }
            }
        }
        Ok(raised)
    }

    fn portfolio_risk_breached(&self, trade: &Trade) -> Result<bool> {
        let Some(portfolio) = self.store.get_portfolio(&trade.portfolio_id)? else {
            return Ok(false);
        };
        let daily_cap = portfolio.total_capital * self.config.daily_loss_limit_ratio;
        let weekly_cap = portfolio.total_capital * self.config.weekly_loss_limit_ratio;
        Ok(portfolio.daily_loss >= daily_cap || portfolio.weekly_loss >= weekly_cap)
    }

    /// Create the PENDING exit intent unless one is already working for this
    /// trade. Runs on the trade partition, which is the dedupe mechanism for
    /// simultaneous tick evaluations.
    async fn raise_exit_intent(
        &self,
        trade: &Trade,
        reason: ExitReason,
    ) -> Result<Option<String>> {
        let store = self.store.clone();
        let trade = trade.clone();
        let product_type = self
            .store
            .get_user_broker(&trade.user_broker_id)?
            .map(|ub| ub.product_type)
            .unwrap_or(ProductType::Cnc);

        self.coordinator
            .run_serialized(&trade.id.clone(), async move {
                if store.find_active_exit_intent(&trade.id)?.is_some() {
                    debug!(trade_id = %trade.id, "exit intent already active — skipping");
                    return Ok(None);
                }
                let now = now_ms();
                let intent = ExitIntent {
                    id: Uuid::new_v4().to_string(),
                    trade_id: trade.id.clone(),
                    user_broker_id: trade.user_broker_id.clone(),
                    exit_reason: reason,
                    calculated_qty: trade.entry_qty,
                    order_type: OrderType::Market,
                    limit_price: None,
                    product_type,
                    status: ExitIntentStatus::Pending,
                    broker_order_id: None,
                    error_code: None,
                    error_message: None,
                    created_at: now,
                    placed_at: None,
                    filled_at: None,
                    updated_at: now,
                    version: 1,
                };
                store.insert_exit_intent(&intent)?;
                info!(
                    exit_intent_id = %intent.id,
                    trade_id = %trade.id,
                    reason = %reason,
                    qty = intent.calculated_qty,
                    "exit intent raised"
                );
                Ok(Some(intent.id))
            })
            .await
    }
}

impl std::fmt::Debug for ExitSignalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitSignalService").finish()
    }
}
