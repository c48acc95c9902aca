// =============================================================================
// Trade persistence — versioned updates back the single-writer coordinator
// =============================================================================

use anyhow::{bail, Context, Result};
use rusqlite::{params, Row};

use super::{col_dec, col_dec_opt, col_enum, col_enum_opt, col_json, dec_sql, dec_sql_opt, json_sql, Store};
use crate::models::Trade;
use crate::types::{now_ms, TradeStatus};

const TRADE_COLS: &str = "id, portfolio_id, user_id, broker_id, user_broker_id, signal_id, \
     intent_id, symbol, direction, status, entry_price, entry_qty, entry_value, entry_at, zone, \
     log_loss_floor, max_log_loss, target_min_profit, target_price, target_stretch, \
     target_primary, current_price, current_log_return, unrealized_pnl, trailing_active, \
     trailing_highest_price, trailing_stop_price, exit_price, exit_at, exit_trigger, \
     exit_order_id, realized_pnl, realized_log_return, holding_days, broker_order_id, \
     client_order_id, last_broker_update_at, error_code, error_message, created_at, \
     updated_at, deleted_at, version";

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        user_id: row.get(2)?,
        broker_id: row.get(3)?,
        user_broker_id: row.get(4)?,
        signal_id: row.get(5)?,
        intent_id: row.get(6)?,
        symbol: row.get(7)?,
        direction: col_enum(row, 8)?,
        status: col_enum(row, 9)?,
        entry_price: col_dec(row, 10)?,
        entry_qty: row.get(11)?,
        entry_value: col_dec(row, 12)?,
        entry_at: row.get(13)?,
        zone: col_json(row, 14)?,
        log_loss_floor: col_dec(row, 15)?,
        max_log_loss: col_dec(row, 16)?,
        target_min_profit: col_dec(row, 17)?,
        target_price: col_dec(row, 18)?,
        target_stretch: col_dec(row, 19)?,
        target_primary: col_dec(row, 20)?,
        current_price: col_dec_opt(row, 21)?,
        current_log_return: col_dec_opt(row, 22)?,
        unrealized_pnl: col_dec_opt(row, 23)?,
        trailing_active: row.get(24)?,
        trailing_highest_price: col_dec_opt(row, 25)?,
        trailing_stop_price: col_dec_opt(row, 26)?,
        exit_price: col_dec_opt(row, 27)?,
        exit_at: row.get(28)?,
        exit_trigger: col_enum_opt(row, 29)?,
        exit_order_id: row.get(30)?,
        realized_pnl: col_dec_opt(row, 31)?,
        realized_log_return: col_dec_opt(row, 32)?,
        holding_days: row.get(33)?,
        broker_order_id: row.get(34)?,
        client_order_id: row.get(35)?,
        last_broker_update_at: row.get(36)?,
        error_code: row.get(37)?,
        error_message: row.get(38)?,
        created_at: row.get(39)?,
        updated_at: row.get(40)?,
        deleted_at: row.get(41)?,
        version: row.get(42)?,
    })
}

impl Store {
    /// Insert a freshly created trade. The unique `intent_id` index makes a
    /// duplicate insert for the same intent fail, which callers treat as
    /// "already created by a previous run".
    pub fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let zone = json_sql(&trade.zone)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trades (id, portfolio_id, user_id, broker_id, user_broker_id, \
                 signal_id, intent_id, symbol, direction, status, entry_price, entry_qty, \
                 entry_value, entry_at, zone, log_loss_floor, max_log_loss, target_min_profit, \
                 target_price, target_stretch, target_primary, current_price, \
                 current_log_return, unrealized_pnl, trailing_active, trailing_highest_price, \
                 trailing_stop_price, exit_price, exit_at, exit_trigger, exit_order_id, \
                 realized_pnl, realized_log_return, holding_days, broker_order_id, \
                 client_order_id, last_broker_update_at, error_code, error_message, \
                 created_at, updated_at, deleted_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,\
                 ?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34,?35,?36,?37,?38,\
                 ?39,?40,?41,?42,?43)",
                params![
                    trade.id,
                    trade.portfolio_id,
                    trade.user_id,
                    trade.broker_id,
                    trade.user_broker_id,
                    trade.signal_id,
                    trade.intent_id,
                    trade.symbol,
                    trade.direction.as_str(),
                    trade.status.as_str(),
                    dec_sql(trade.entry_price),
                    trade.entry_qty,
                    dec_sql(trade.entry_value),
                    trade.entry_at,
                    zone,
                    dec_sql(trade.log_loss_floor),
                    dec_sql(trade.max_log_loss),
                    dec_sql(trade.target_min_profit),
                    dec_sql(trade.target_price),
                    dec_sql(trade.target_stretch),
                    dec_sql(trade.target_primary),
                    dec_sql_opt(trade.current_price),
                    dec_sql_opt(trade.current_log_return),
                    dec_sql_opt(trade.unrealized_pnl),
                    trade.trailing_active,
                    dec_sql_opt(trade.trailing_highest_price),
                    dec_sql_opt(trade.trailing_stop_price),
                    dec_sql_opt(trade.exit_price),
                    trade.exit_at,
                    trade.exit_trigger.map(|t| t.as_str()),
                    trade.exit_order_id,
                    dec_sql_opt(trade.realized_pnl),
                    dec_sql_opt(trade.realized_log_return),
                    trade.holding_days,
                    trade.broker_order_id,
                    trade.client_order_id,
                    trade.last_broker_update_at,
                    trade.error_code,
                    trade.error_message,
                    trade.created_at,
                    trade.updated_at,
                    trade.deleted_at,
                    trade.version,
                ],
            )
            .context("failed to insert trade")?;
            Ok(())
        })
    }

    pub fn get_trade(&self, id: &str) -> Result<Option<Trade>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {TRADE_COLS} FROM trades WHERE id = ?1"))?;
            let mut rows = stmt.query_map(params![id], trade_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn find_trade_by_intent(&self, intent_id: &str) -> Result<Option<Trade>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades WHERE intent_id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![intent_id], trade_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_trades_by_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades \
                 WHERE status = ?1 AND deleted_at IS NULL ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], trade_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Persist every mutable field of a trade with an optimistic version
    /// check. On success the in-memory version and updated_at advance to
    /// match the row. A conflict means another writer got there first, which
    /// the single-writer coordinator treats as a hard error.
    pub fn persist_trade(&self, trade: &mut Trade) -> Result<()> {
        let zone = json_sql(&trade.zone)?;
        let now = now_ms();
        let updated = self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE trades SET status = ?1, entry_price = ?2, entry_qty = ?3, \
                 entry_value = ?4, entry_at = ?5, zone = ?6, log_loss_floor = ?7, \
                 max_log_loss = ?8, target_min_profit = ?9, target_price = ?10, \
                 target_stretch = ?11, target_primary = ?12, current_price = ?13, \
                 current_log_return = ?14, unrealized_pnl = ?15, trailing_active = ?16, \
                 trailing_highest_price = ?17, trailing_stop_price = ?18, exit_price = ?19, \
                 exit_at = ?20, exit_trigger = ?21, exit_order_id = ?22, realized_pnl = ?23, \
                 realized_log_return = ?24, holding_days = ?25, broker_order_id = ?26, \
                 last_broker_update_at = ?27, error_code = ?28, error_message = ?29, \
                 updated_at = ?30, version = version + 1 \
                 WHERE id = ?31 AND version = ?32 AND deleted_at IS NULL",
                params![
                    trade.status.as_str(),
                    dec_sql(trade.entry_price),
                    trade.entry_qty,
                    dec_sql(trade.entry_value),
                    trade.entry_at,
                    zone,
                    dec_sql(trade.log_loss_floor),
                    dec_sql(trade.max_log_loss),
                    dec_sql(trade.target_min_profit),
                    dec_sql(trade.target_price),
                    dec_sql(trade.target_stretch),
                    dec_sql(trade.target_primary),
                    dec_sql_opt(trade.current_price),
                    dec_sql_opt(trade.current_log_return),
                    dec_sql_opt(trade.unrealized_pnl),
                    trade.trailing_active,
                    dec_sql_opt(trade.trailing_highest_price),
                    dec_sql_opt(trade.trailing_stop_price),
                    dec_sql_opt(trade.exit_price),
                    trade.exit_at,
                    trade.exit_trigger.map(|t| t.as_str()),
                    trade.exit_order_id,
                    dec_sql_opt(trade.realized_pnl),
                    dec_sql_opt(trade.realized_log_return),
                    trade.holding_days,
                    trade.broker_order_id,
                    trade.last_broker_update_at,
                    trade.error_code,
                    trade.error_message,
                    now,
                    trade.id,
                    trade.version,
                ],
            )?;
            Ok(updated)
        })?;

        if updated == 0 {
            bail!(
                "optimistic concurrency conflict persisting trade {} at version {}",
                trade.id,
                trade.version
            );
        }
        trade.version += 1;
        trade.updated_at = now;
        Ok(())
    }

    /// Heartbeat-only update: refresh `last_broker_update_at` without minting
    /// a new version. Used by the reconcilers when nothing material changed.
    pub fn touch_trade_heartbeat(&self, id: &str, ts: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE trades SET last_broker_update_at = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
            Ok(updated > 0)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::MtfZoneSnapshot;
    use crate::types::Direction;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_trade(id: &str, intent_id: &str, symbol: &str) -> Trade {
        Trade {
            id: id.into(),
            portfolio_id: "p1".into(),
            user_id: "u1".into(),
            broker_id: "b1".into(),
            user_broker_id: "ub1".into(),
            signal_id: "s1".into(),
            intent_id: intent_id.into(),
            symbol: symbol.into(),
            direction: Direction::Buy,
            status: TradeStatus::Created,
            entry_price: dec!(500.00),
            entry_qty: 20,
            entry_value: dec!(10000.00),
            entry_at: None,
            zone: MtfZoneSnapshot::default(),
            log_loss_floor: dec!(490.00),
            max_log_loss: dec!(0.020000),
            target_min_profit: dec!(505.00),
            target_price: dec!(510.00),
            target_stretch: dec!(520.00),
            target_primary: dec!(510.00),
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
            client_order_id: intent_id.into(),
            last_broker_update_at: now_ms(),
            error_code: None,
            error_message: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn insert_and_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade("t1", "i1", "SBIN");
        store.insert_trade(&trade).unwrap();

        let loaded = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(loaded.entry_price, dec!(500.00));
        assert_eq!(loaded.status, TradeStatus::Created);
        assert_eq!(loaded.client_order_id, "i1");
        assert!(loaded.current_price.is_none());
    }

    #[test]
    fn intent_id_is_unique_across_trades() {
        let store = Store::open_in_memory().unwrap();
        store.insert_trade(&sample_trade("t1", "i1", "SBIN")).unwrap();
        assert!(store.insert_trade(&sample_trade("t2", "i1", "SBIN")).is_err());
    }

    #[test]
    fn broker_order_id_partial_unique() {
        let store = Store::open_in_memory().unwrap();
        // Two trades without broker order ids coexist.
        store.insert_trade(&sample_trade("t1", "i1", "SBIN")).unwrap();
        store.insert_trade(&sample_trade("t2", "i2", "INFY")).unwrap();

        let mut t1 = store.get_trade("t1").unwrap().unwrap();
        t1.broker_order_id = Some("BRK1".into());
        store.persist_trade(&mut t1).unwrap();

        let mut t2 = store.get_trade("t2").unwrap().unwrap();
        t2.broker_order_id = Some("BRK1".into());
        assert!(store.persist_trade(&mut t2).is_err());
    }

    #[test]
    fn versioned_update_detects_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.insert_trade(&sample_trade("t1", "i1", "SBIN")).unwrap();

        let mut copy_a = store.get_trade("t1").unwrap().unwrap();
        let mut copy_b = store.get_trade("t1").unwrap().unwrap();

        copy_a.status = TradeStatus::Pending;
        store.persist_trade(&mut copy_a).unwrap();
        assert_eq!(copy_a.version, 2);

        copy_b.status = TradeStatus::Rejected;
        assert!(store.persist_trade(&mut copy_b).is_err());

        let loaded = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Pending);
    }

    #[test]
    fn list_by_status_filters() {
        let store = Store::open_in_memory().unwrap();
        let mut trade = sample_trade("t1", "i1", "SBIN");
        trade.status = TradeStatus::Pending;
        store.insert_trade(&trade).unwrap();
        store.insert_trade(&sample_trade("t2", "i2", "INFY")).unwrap();

        let pending = store.list_trades_by_status(TradeStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1");
    }
}
