// =============================================================================
// Candle persistence — append-only, immutable once finalized
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_dec, col_enum, dec_sql, Store};
use crate::models::Candle;
use crate::types::{now_ms, Timeframe};

const CANDLE_COLS: &str = "symbol, timeframe, open_time, open, high, low, close, volume";

fn candle_from_row(row: &Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        symbol: row.get(0)?,
        timeframe: col_enum(row, 1)?,
        open_time: row.get(2)?,
        open: col_dec(row, 3)?,
        high: col_dec(row, 4)?,
        low: col_dec(row, 5)?,
        close: col_dec(row, 6)?,
        volume: row.get(7)?,
    })
}

impl Store {
    /// Append a finalized candle. Re-finalizing the same bucket (e.g. after a
    /// restart replays a window) is a no-op rather than an error.
    pub fn insert_candle(&self, candle: &Candle) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO candles (symbol, timeframe, open_time, open, high, \
                     low, close, volume, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        candle.symbol,
                        candle.timeframe.as_str(),
                        candle.open_time,
                        dec_sql(candle.open),
                        dec_sql(candle.high),
                        dec_sql(candle.low),
                        dec_sql(candle.close),
                        candle.volume,
                        now_ms(),
                    ],
                )
                .context("failed to insert candle")?;
            Ok(inserted > 0)
        })
    }

    pub fn latest_candle(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CANDLE_COLS} FROM candles \
                 WHERE symbol = ?1 AND timeframe = ?2 ORDER BY open_time DESC LIMIT 1"
            ))?;
            let mut rows =
                stmt.query_map(params![symbol, timeframe.as_str()], candle_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Candles in `[from, to)` open-time order.
    pub fn list_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CANDLE_COLS} FROM candles \
                 WHERE symbol = ?1 AND timeframe = ?2 AND open_time >= ?3 AND open_time < ?4 \
                 ORDER BY open_time"
            ))?;
            let rows = stmt.query_map(
                params![symbol, timeframe.as_str(), from, to],
                candle_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn count_candles(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
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

    pub(crate) fn sample_candle(symbol: &str, tf: Timeframe, open_time: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            timeframe: tf,
            open_time,
            open: dec!(100.00),
            high: dec!(101.50),
            low: dec!(99.50),
            close: dec!(101.00),
            volume: 1200,
        }
    }

    #[test]
    fn duplicate_finalization_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let candle = sample_candle("SBIN", Timeframe::M5, 300_000);
        assert!(store.insert_candle(&candle).unwrap());
        assert!(!store.insert_candle(&candle).unwrap());
        assert_eq!(store.count_candles("SBIN", Timeframe::M5).unwrap(), 1);
    }

    #[test]
    fn latest_and_range_queries() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_candle(&sample_candle("SBIN", Timeframe::M1, i * 60_000))
                .unwrap();
        }
        let latest = store.latest_candle("SBIN", Timeframe::M1).unwrap().unwrap();
        assert_eq!(latest.open_time, 4 * 60_000);

        let range = store
            .list_candles("SBIN", Timeframe::M1, 60_000, 240_000)
            .unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].open_time, 60_000);
    }

    #[test]
    fn timeframes_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_candle(&sample_candle("SBIN", Timeframe::M1, 0))
            .unwrap();
        assert!(store.latest_candle("SBIN", Timeframe::M5).unwrap().is_none());
    }
}
