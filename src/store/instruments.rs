// =============================================================================
// Instrument master persistence
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_dec, col_json, dec_sql, json_sql, Store};
use crate::models::Instrument;

const INSTRUMENT_COLS: &str = "id, exchange, trading_symbol, name, broker_tokens, lot_size, \
     tick_size, created_at, updated_at, version";

fn instrument_from_row(row: &Row<'_>) -> rusqlite::Result<Instrument> {
    Ok(Instrument {
        id: row.get(0)?,
        exchange: row.get(1)?,
        trading_symbol: row.get(2)?,
        name: row.get(3)?,
        broker_tokens: col_json(row, 4)?,
        lot_size: row.get(5)?,
        tick_size: col_dec(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        version: row.get(9)?,
    })
}

impl Store {
    /// Upsert keyed on `(exchange, trading_symbol)`; the daily refresh merges
    /// broker token mappings into the existing record.
    pub fn upsert_instrument(&self, instrument: &Instrument) -> Result<()> {
        let tokens = json_sql(&instrument.broker_tokens)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instruments (id, exchange, trading_symbol, name, broker_tokens, \
                 lot_size, tick_size, created_at, updated_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10) \
                 ON CONFLICT(exchange, trading_symbol) DO UPDATE SET name = excluded.name, \
                 broker_tokens = excluded.broker_tokens, lot_size = excluded.lot_size, \
                 tick_size = excluded.tick_size, updated_at = excluded.updated_at, \
                 version = instruments.version + 1",
                params![
                    instrument.id,
                    instrument.exchange,
                    instrument.trading_symbol,
                    instrument.name,
                    tokens,
                    instrument.lot_size,
                    dec_sql(instrument.tick_size),
                    instrument.created_at,
                    instrument.updated_at,
                    instrument.version,
                ],
            )
            .context("failed to upsert instrument")?;
            Ok(())
        })
    }

    pub fn find_instrument(&self, exchange: &str, trading_symbol: &str) -> Result<Option<Instrument>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTRUMENT_COLS} FROM instruments \
                 WHERE exchange = ?1 AND trading_symbol = ?2"
            ))?;
            let mut rows = stmt.query_map(params![exchange, trading_symbol], instrument_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn count_instruments(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM instruments", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn sample_instrument(symbol: &str) -> Instrument {
        Instrument {
            id: format!("NSE:{symbol}"),
            exchange: "NSE".into(),
            trading_symbol: symbol.into(),
            name: format!("{symbol} Ltd"),
            broker_tokens: json!({ "ZERODHA": { "instrument_token": 779521 } }),
            lot_size: 1,
            tick_size: dec!(0.05),
            created_at: now_ms(),
            updated_at: now_ms(),
            version: 1,
        }
    }

    #[test]
    fn upsert_merges_on_symbol_key() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_instrument(&sample_instrument("SBIN")).unwrap();

        let mut updated = sample_instrument("SBIN");
        updated.broker_tokens = json!({
            "ZERODHA": { "instrument_token": 779521 },
            "DHAN": { "security_id": "1333" }
        });
        store.upsert_instrument(&updated).unwrap();

        assert_eq!(store.count_instruments().unwrap(), 1);
        let found = store.find_instrument("NSE", "SBIN").unwrap().unwrap();
        assert!(found.broker_tokens.get("DHAN").is_some());
        assert_eq!(found.version, 2);
    }
}
