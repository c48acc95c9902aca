// =============================================================================
// Portfolio and watchlist persistence
// =============================================================================

use anyhow::{bail, Context, Result};
use rusqlite::{params, Row};

use super::{col_dec, dec_sql, Store};
use crate::models::{Portfolio, WatchlistEntry};
use crate::types::now_ms;

const PORTFOLIO_COLS: &str = "id, user_id, total_capital, available_capital, current_exposure, \
     current_log_exposure, open_trade_count, daily_loss, weekly_loss, cooldown_until, paused, \
     created_at, updated_at, deleted_at, version";

fn portfolio_from_row(row: &Row<'_>) -> rusqlite::Result<Portfolio> {
    Ok(Portfolio {
        id: row.get(0)?,
        user_id: row.get(1)?,
        total_capital: col_dec(row, 2)?,
        available_capital: col_dec(row, 3)?,
        current_exposure: col_dec(row, 4)?,
        current_log_exposure: col_dec(row, 5)?,
        open_trade_count: row.get(6)?,
        daily_loss: col_dec(row, 7)?,
        weekly_loss: col_dec(row, 8)?,
        cooldown_until: row.get(9)?,
        paused: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        deleted_at: row.get(13)?,
        version: row.get(14)?,
    })
}

impl Store {
    pub fn insert_portfolio(&self, p: &Portfolio) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO portfolios (id, user_id, total_capital, available_capital, \
                 current_exposure, current_log_exposure, open_trade_count, daily_loss, \
                 weekly_loss, cooldown_until, paused, created_at, updated_at, deleted_at, \
                 version) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    p.id,
                    p.user_id,
                    dec_sql(p.total_capital),
                    dec_sql(p.available_capital),
                    dec_sql(p.current_exposure),
                    dec_sql(p.current_log_exposure),
                    p.open_trade_count,
                    dec_sql(p.daily_loss),
                    dec_sql(p.weekly_loss),
                    p.cooldown_until,
                    p.paused,
                    p.created_at,
                    p.updated_at,
                    p.deleted_at,
                    p.version,
                ],
            )
            .context("failed to insert portfolio")?;
            Ok(())
        })
    }

    pub fn get_portfolio(&self, id: &str) -> Result<Option<Portfolio>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PORTFOLIO_COLS} FROM portfolios WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], portfolio_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn find_portfolio_by_user(&self, user_id: &str) -> Result<Option<Portfolio>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PORTFOLIO_COLS} FROM portfolios \
                 WHERE user_id = ?1 AND deleted_at IS NULL LIMIT 1"
            ))?;
            let mut rows = stmt.query_map(params![user_id], portfolio_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Versioned full update, mirroring `persist_trade`.
    pub fn persist_portfolio(&self, p: &mut Portfolio) -> Result<()> {
        let now = now_ms();
        let updated = self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portfolios SET total_capital = ?1, available_capital = ?2, \
                 current_exposure = ?3, current_log_exposure = ?4, open_trade_count = ?5, \
                 daily_loss = ?6, weekly_loss = ?7, cooldown_until = ?8, paused = ?9, \
                 updated_at = ?10, version = version + 1 \
                 WHERE id = ?11 AND version = ?12 AND deleted_at IS NULL",
                params![
                    dec_sql(p.total_capital),
                    dec_sql(p.available_capital),
                    dec_sql(p.current_exposure),
                    dec_sql(p.current_log_exposure),
                    p.open_trade_count,
                    dec_sql(p.daily_loss),
                    dec_sql(p.weekly_loss),
                    p.cooldown_until,
                    p.paused,
                    now,
                    p.id,
                    p.version,
                ],
            )?;
            Ok(updated)
        })?;
        if updated == 0 {
            bail!(
                "optimistic concurrency conflict persisting portfolio {} at version {}",
                p.id,
                p.version
            );
        }
        p.version += 1;
        p.updated_at = now;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Watchlists
    // -------------------------------------------------------------------------

    pub fn upsert_watchlist_entry(&self, entry: &WatchlistEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO watchlists (id, symbol, exchange, enabled, created_at, updated_at) \
                 VALUES (?1,?2,?3,?4,?5,?6) \
                 ON CONFLICT(exchange, symbol) DO UPDATE SET enabled = excluded.enabled, \
                 updated_at = excluded.updated_at",
                params![
                    entry.id,
                    entry.symbol,
                    entry.exchange,
                    entry.enabled,
                    entry.created_at,
                    entry.updated_at,
                ],
            )
            .context("failed to upsert watchlist entry")?;
            Ok(())
        })
    }

    /// Union of enabled watchlist symbols; drives tick subscription.
    pub fn list_enabled_symbols(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT symbol FROM watchlists WHERE enabled = 1 ORDER BY symbol",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_portfolio(id: &str, user_id: &str) -> Portfolio {
        Portfolio {
            id: id.into(),
            user_id: user_id.into(),
            total_capital: dec!(100000.00),
            available_capital: dec!(100000.00),
            current_exposure: dec!(0.00),
            current_log_exposure: dec!(0.000000),
            open_trade_count: 0,
            daily_loss: dec!(0.00),
            weekly_loss: dec!(0.00),
            cooldown_until: None,
            paused: false,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn portfolio_roundtrip_and_versioning() {
        let store = Store::open_in_memory().unwrap();
        store.insert_portfolio(&sample_portfolio("p1", "u1")).unwrap();

        let mut p = store.find_portfolio_by_user("u1").unwrap().unwrap();
        assert_eq!(p.total_capital, dec!(100000.00));

        p.open_trade_count = 1;
        p.available_capital = dec!(90000.00);
        store.persist_portfolio(&mut p).unwrap();
        assert_eq!(p.version, 2);

        let reloaded = store.get_portfolio("p1").unwrap().unwrap();
        assert_eq!(reloaded.available_capital, dec!(90000.00));
    }

    #[test]
    fn watchlist_union_is_distinct_and_enabled_only() {
        let store = Store::open_in_memory().unwrap();
        let now = now_ms();
        for (id, symbol, enabled) in [("w1", "SBIN", true), ("w2", "INFY", true), ("w3", "TCS", false)] {
            store
                .upsert_watchlist_entry(&WatchlistEntry {
                    id: id.into(),
                    symbol: symbol.into(),
                    exchange: "NSE".into(),
                    enabled,
                    created_at: now,
                    updated_at: now,
                })
                .unwrap();
        }
        assert_eq!(store.list_enabled_symbols().unwrap(), vec!["INFY", "SBIN"]);
    }
}
