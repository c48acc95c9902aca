// =============================================================================
// Signal persistence
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_dec, col_enum, col_json, dec_sql, json_sql, Store};
use crate::models::Signal;
use crate::types::{now_ms, Direction, SignalStatus, SignalType};

const SIGNAL_COLS: &str = "id, symbol, direction, signal_type, status, signal_day, zone, \
     confluence_type, confluence_score, p_win, p_fill, kelly, ref_price, bid, ask, \
     entry_low, entry_high, effective_floor, effective_ceiling, reason, expires_at, \
     created_at, updated_at, deleted_at, version";

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<Signal> {
    Ok(Signal {
        id: row.get(0)?,
        symbol: row.get(1)?,
        direction: col_enum(row, 2)?,
        signal_type: col_enum(row, 3)?,
        status: col_enum(row, 4)?,
        signal_day: row.get(5)?,
        zone: col_json(row, 6)?,
        confluence_type: col_enum(row, 7)?,
        confluence_score: col_dec(row, 8)?,
        p_win: col_dec(row, 9)?,
        p_fill: col_dec(row, 10)?,
        kelly: col_dec(row, 11)?,
        ref_price: col_dec(row, 12)?,
        bid: col_dec(row, 13)?,
        ask: col_dec(row, 14)?,
        entry_low: col_dec(row, 15)?,
        entry_high: col_dec(row, 16)?,
        effective_floor: col_dec(row, 17)?,
        effective_ceiling: col_dec(row, 18)?,
        reason: row.get(19)?,
        expires_at: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
        deleted_at: row.get(23)?,
        version: row.get(24)?,
    })
}

impl Store {
    pub fn insert_signal(&self, signal: &Signal) -> Result<()> {
        let zone = json_sql(&signal.zone)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signals (id, symbol, direction, signal_type, status, signal_day, \
                 zone, confluence_type, confluence_score, p_win, p_fill, kelly, ref_price, bid, \
                 ask, entry_low, entry_high, effective_floor, effective_ceiling, reason, \
                 expires_at, created_at, updated_at, deleted_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,\
                 ?20,?21,?22,?23,?24,?25)",
                params![
                    signal.id,
                    signal.symbol,
                    signal.direction.as_str(),
                    signal.signal_type.as_str(),
                    signal.status.as_str(),
                    signal.signal_day,
                    zone,
                    signal.confluence_type.as_str(),
                    dec_sql(signal.confluence_score),
                    dec_sql(signal.p_win),
                    dec_sql(signal.p_fill),
                    dec_sql(signal.kelly),
                    dec_sql(signal.ref_price),
                    dec_sql(signal.bid),
                    dec_sql(signal.ask),
                    dec_sql(signal.entry_low),
                    dec_sql(signal.entry_high),
                    dec_sql(signal.effective_floor),
                    dec_sql(signal.effective_ceiling),
                    signal.reason,
                    signal.expires_at,
                    signal.created_at,
                    signal.updated_at,
                    signal.deleted_at,
                    signal.version,
                ],
            )
            .context("failed to insert signal")?;
            Ok(())
        })
    }

    pub fn get_signal(&self, id: &str) -> Result<Option<Signal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], signal_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// The live signal holding a dedupe key, if any.
    pub fn find_live_signal(
        &self,
        symbol: &str,
        signal_day: &str,
        signal_type: SignalType,
        direction: Direction,
    ) -> Result<Option<Signal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SIGNAL_COLS} FROM signals \
                 WHERE symbol = ?1 AND signal_day = ?2 AND signal_type = ?3 \
                 AND direction = ?4 AND status = 'ACTIVE' AND deleted_at IS NULL"
            ))?;
            let mut rows = stmt.query_map(
                params![symbol, signal_day, signal_type.as_str(), direction.as_str()],
                signal_from_row,
            )?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Transition a signal's status, bumping its version.
    pub fn mark_signal_status(&self, id: &str, status: SignalStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE signals SET status = ?1, updated_at = ?2, version = version + 1 \
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![status.as_str(), now_ms(), id],
            )?;
            Ok(updated > 0)
        })
    }

    /// ACTIVE signals whose expiry has passed.
    pub fn list_expired_active_signals(&self, now: i64) -> Result<Vec<Signal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SIGNAL_COLS} FROM signals \
                 WHERE status = 'ACTIVE' AND deleted_at IS NULL AND expires_at <= ?1"
            ))?;
            let rows = stmt.query_map(params![now], signal_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn list_signals_by_status(&self, status: SignalStatus) -> Result<Vec<Signal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SIGNAL_COLS} FROM signals \
                 WHERE status = ?1 AND deleted_at IS NULL ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], signal_from_row)?;
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
    use crate::models::MtfZoneSnapshot;
    use crate::types::ConfluenceType;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_signal(id: &str, symbol: &str) -> Signal {
        Signal {
            id: id.into(),
            symbol: symbol.into(),
            direction: Direction::Buy,
            signal_type: SignalType::Entry,
            status: SignalStatus::Active,
            signal_day: "2026-08-01".into(),
            zone: MtfZoneSnapshot::default(),
            confluence_type: ConfluenceType::Triple,
            confluence_score: dec!(0.8123),
            p_win: dec!(0.62),
            p_fill: dec!(0.9),
            kelly: dec!(0.08),
            ref_price: dec!(500.00),
            bid: dec!(499.95),
            ask: dec!(500.05),
            entry_low: dec!(498.00),
            entry_high: dec!(503.00),
            effective_floor: dec!(490.00),
            effective_ceiling: dec!(520.00),
            reason: "triple confluence zone touch".into(),
            expires_at: now_ms() + 3_600_000,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let sig = sample_signal("s1", "SBIN");
        store.insert_signal(&sig).unwrap();

        let loaded = store.get_signal("s1").unwrap().unwrap();
        assert_eq!(loaded.symbol, "SBIN");
        assert_eq!(loaded.ref_price, dec!(500.00));
        assert_eq!(loaded.confluence_type, ConfluenceType::Triple);
        assert_eq!(loaded.status, SignalStatus::Active);
    }

    #[test]
    fn dedupe_index_rejects_second_live_signal() {
        let store = Store::open_in_memory().unwrap();
        store.insert_signal(&sample_signal("s1", "SBIN")).unwrap();
        let dup = sample_signal("s2", "SBIN");
        assert!(store.insert_signal(&dup).is_err());
    }

    #[test]
    fn superseded_signal_releases_dedupe_key() {
        let store = Store::open_in_memory().unwrap();
        store.insert_signal(&sample_signal("s1", "SBIN")).unwrap();
        assert!(store
            .mark_signal_status("s1", SignalStatus::Superseded)
            .unwrap());
        // Key is free again.
        store.insert_signal(&sample_signal("s2", "SBIN")).unwrap();
        let live = store
            .find_live_signal("SBIN", "2026-08-01", SignalType::Entry, Direction::Buy)
            .unwrap()
            .unwrap();
        assert_eq!(live.id, "s2");
    }

    #[test]
    fn expiry_scan_finds_due_signals() {
        let store = Store::open_in_memory().unwrap();
        let mut sig = sample_signal("s1", "SBIN");
        sig.expires_at = 10;
        store.insert_signal(&sig).unwrap();
        let due = store.list_expired_active_signals(11).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "s1");
    }
}
