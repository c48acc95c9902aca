// =============================================================================
// Trade intent persistence
// =============================================================================
//
// Intents are only ever inserted through the delivery-consumption transaction
// in `deliveries.rs`; this module covers reads and status transitions.
// =============================================================================

use anyhow::Result;
use rusqlite::{params, Row};

use super::{col_dec, col_dec_opt, col_enum, col_json, Store};
use crate::models::TradeIntent;
use crate::types::{now_ms, IntentStatus};

const INTENT_COLS: &str = "intent_id, signal_id, user_id, broker_id, user_broker_id, \
     validation_passed, errors, calculated_qty, calculated_value, order_type, limit_price, \
     product_type, log_impact, portfolio_exposure_after, status, created_at, updated_at, version";

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<TradeIntent> {
    Ok(TradeIntent {
        intent_id: row.get(0)?,
        signal_id: row.get(1)?,
        user_id: row.get(2)?,
        broker_id: row.get(3)?,
        user_broker_id: row.get(4)?,
        validation_passed: row.get(5)?,
        errors: col_json(row, 6)?,
        calculated_qty: row.get(7)?,
        calculated_value: col_dec(row, 8)?,
        order_type: col_enum(row, 9)?,
        limit_price: col_dec_opt(row, 10)?,
        product_type: col_enum(row, 11)?,
        log_impact: col_dec(row, 12)?,
        portfolio_exposure_after: col_dec(row, 13)?,
        status: col_enum(row, 14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        version: row.get(17)?,
    })
}

impl Store {
    pub fn get_intent(&self, intent_id: &str) -> Result<Option<TradeIntent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTENT_COLS} FROM trade_intents WHERE intent_id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![intent_id], intent_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_intents_by_status(&self, status: IntentStatus) -> Result<Vec<TradeIntent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTENT_COLS} FROM trade_intents \
                 WHERE status = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], intent_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Predicated status transition; returns whether this caller won it.
    pub fn cas_intent_status(
        &self,
        intent_id: &str,
        from: IntentStatus,
        to: IntentStatus,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE trade_intents SET status = ?1, updated_at = ?2, version = version + 1 \
                 WHERE intent_id = ?3 AND status = ?4",
                params![to.as_str(), now_ms(), intent_id, from.as_str()],
            )?;
            Ok(updated > 0)
        })
    }

    /// How many intents exist for one (signal, user-broker) pair. Exercised
    /// by the at-most-once consumption tests.
    pub fn count_intents_for_pair(&self, signal_id: &str, user_broker_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trade_intents \
                 WHERE signal_id = ?1 AND user_broker_id = ?2",
                params![signal_id, user_broker_id],
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
mod tests {
    use super::super::deliveries::tests::{sample_delivery, sample_intent};
    use super::*;

    #[test]
    fn status_cas_single_winner() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_delivery(&sample_delivery("d1", "s1", "ub1"))
            .unwrap();
        store
            .consume_delivery_with_intent("d1", &sample_intent("i1", "s1", "ub1"))
            .unwrap();

        assert!(store
            .cas_intent_status("i1", IntentStatus::Approved, IntentStatus::Executed)
            .unwrap());
        // Second executor loses.
        assert!(!store
            .cas_intent_status("i1", IntentStatus::Approved, IntentStatus::Executed)
            .unwrap());

        let intent = store.get_intent("i1").unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Executed);
        assert_eq!(intent.version, 2);
    }

    #[test]
    fn pair_count_reflects_consumption() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_delivery(&sample_delivery("d1", "s1", "ub1"))
            .unwrap();
        assert_eq!(store.count_intents_for_pair("s1", "ub1").unwrap(), 0);
        store
            .consume_delivery_with_intent("d1", &sample_intent("i1", "s1", "ub1"))
            .unwrap();
        assert_eq!(store.count_intents_for_pair("s1", "ub1").unwrap(), 1);
    }
}
