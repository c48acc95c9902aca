// =============================================================================
// Exit intent persistence — including the atomic APPROVED->PLACED claim
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_dec_opt, col_enum, dec_sql_opt, Store};
use crate::models::ExitIntent;
use crate::types::{now_ms, ExitIntentStatus};

const EXIT_COLS: &str = "id, trade_id, user_broker_id, exit_reason, calculated_qty, order_type, \
     limit_price, product_type, status, broker_order_id, error_code, error_message, created_at, \
     placed_at, filled_at, updated_at, version";

fn exit_from_row(row: &Row<'_>) -> rusqlite::Result<ExitIntent> {
    Ok(ExitIntent {
        id: row.get(0)?,
        trade_id: row.get(1)?,
        user_broker_id: row.get(2)?,
        exit_reason: col_enum(row, 3)?,
        calculated_qty: row.get(4)?,
        order_type: col_enum(row, 5)?,
        limit_price: col_dec_opt(row, 6)?,
        product_type: col_enum(row, 7)?,
        status: col_enum(row, 8)?,
        broker_order_id: row.get(9)?,
        error_code: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        placed_at: row.get(13)?,
        filled_at: row.get(14)?,
        updated_at: row.get(15)?,
        version: row.get(16)?,
    })
}

impl Store {
    pub fn insert_exit_intent(&self, intent: &ExitIntent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO exit_intents (id, trade_id, user_broker_id, exit_reason, \
                 calculated_qty, order_type, limit_price, product_type, status, \
                 broker_order_id, error_code, error_message, created_at, placed_at, filled_at, \
                 updated_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                params![
                    intent.id,
                    intent.trade_id,
                    intent.user_broker_id,
                    intent.exit_reason.as_str(),
                    intent.calculated_qty,
                    intent.order_type.as_str(),
                    dec_sql_opt(intent.limit_price),
                    intent.product_type.as_str(),
                    intent.status.as_str(),
                    intent.broker_order_id,
                    intent.error_code,
                    intent.error_message,
                    intent.created_at,
                    intent.placed_at,
                    intent.filled_at,
                    intent.updated_at,
                    intent.version,
                ],
            )
            .context("failed to insert exit intent")?;
            Ok(())
        })
    }

    pub fn get_exit_intent(&self, id: &str) -> Result<Option<ExitIntent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXIT_COLS} FROM exit_intents WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], exit_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_exit_intents_by_status(
        &self,
        status: ExitIntentStatus,
    ) -> Result<Vec<ExitIntent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXIT_COLS} FROM exit_intents WHERE status = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], exit_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Any exit intent for this trade still working its way to the broker.
    pub fn find_active_exit_intent(&self, trade_id: &str) -> Result<Option<ExitIntent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXIT_COLS} FROM exit_intents \
                 WHERE trade_id = ?1 AND status IN ('PENDING','APPROVED','PLACED') \
                 ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query_map(params![trade_id], exit_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Predicated transition; only one caller can win a given edge. Stamps
    /// `placed_at` when the target status is PLACED and `filled_at` when the
    /// target is FILLED.
    pub fn cas_exit_intent_status(
        &self,
        id: &str,
        from: ExitIntentStatus,
        to: ExitIntentStatus,
    ) -> Result<bool> {
        let now = now_ms();
        let placed_at = (to == ExitIntentStatus::Placed).then_some(now);
        let filled_at = (to == ExitIntentStatus::Filled).then_some(now);
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE exit_intents SET status = ?1, \
                 placed_at = COALESCE(?2, placed_at), filled_at = COALESCE(?3, filled_at), \
                 updated_at = ?4, version = version + 1 \
                 WHERE id = ?5 AND status = ?6",
                params![to.as_str(), placed_at, filled_at, now, id, from.as_str()],
            )?;
            Ok(updated > 0)
        })
    }

    /// Record the broker order id once placement succeeds.
    pub fn set_exit_intent_broker_order(&self, id: &str, broker_order_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE exit_intents SET broker_order_id = ?1, updated_at = ?2, \
                 version = version + 1 WHERE id = ?3",
                params![broker_order_id, now_ms(), id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Mark an exit intent failed with the broker's error payload.
    pub fn fail_exit_intent(
        &self,
        id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE exit_intents SET status = 'FAILED', error_code = ?1, \
                 error_message = ?2, updated_at = ?3, version = version + 1 \
                 WHERE id = ?4 AND status NOT IN ('FILLED','CANCELLED')",
                params![error_code, error_message, now_ms(), id],
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
    use crate::types::{ExitReason, OrderType, ProductType};

    pub(crate) fn sample_exit_intent(id: &str, trade_id: &str) -> ExitIntent {
        ExitIntent {
            id: id.into(),
            trade_id: trade_id.into(),
            user_broker_id: "ub1".into(),
            exit_reason: ExitReason::TargetHit,
            calculated_qty: 20,
            order_type: OrderType::Market,
            limit_price: None,
            product_type: ProductType::Cnc,
            status: ExitIntentStatus::Pending,
            broker_order_id: None,
            error_code: None,
            error_message: None,
            created_at: now_ms(),
            placed_at: None,
            filled_at: None,
            updated_at: now_ms(),
            version: 1,
        }
    }

    #[test]
    fn approved_to_placed_single_winner() {
        let store = Store::open_in_memory().unwrap();
        let mut intent = sample_exit_intent("e1", "t1");
        intent.status = ExitIntentStatus::Approved;
        store.insert_exit_intent(&intent).unwrap();

        assert!(store
            .cas_exit_intent_status("e1", ExitIntentStatus::Approved, ExitIntentStatus::Placed)
            .unwrap());
        // A duplicate processor cannot also place.
        assert!(!store
            .cas_exit_intent_status("e1", ExitIntentStatus::Approved, ExitIntentStatus::Placed)
            .unwrap());

        let loaded = store.get_exit_intent("e1").unwrap().unwrap();
        assert_eq!(loaded.status, ExitIntentStatus::Placed);
        assert!(loaded.placed_at.is_some());
        assert!(loaded.filled_at.is_none());
    }

    #[test]
    fn active_intent_lookup_ignores_terminal() {
        let store = Store::open_in_memory().unwrap();
        let mut failed = sample_exit_intent("e1", "t1");
        failed.status = ExitIntentStatus::Failed;
        store.insert_exit_intent(&failed).unwrap();
        assert!(store.find_active_exit_intent("t1").unwrap().is_none());

        store
            .insert_exit_intent(&sample_exit_intent("e2", "t1"))
            .unwrap();
        let active = store.find_active_exit_intent("t1").unwrap().unwrap();
        assert_eq!(active.id, "e2");
    }

    #[test]
    fn failing_preserves_broker_payload() {
        let store = Store::open_in_memory().unwrap();
        let mut intent = sample_exit_intent("e1", "t1");
        intent.status = ExitIntentStatus::Placed;
        store.insert_exit_intent(&intent).unwrap();

        store
            .fail_exit_intent("e1", "TIMEOUT", "no broker update within window")
            .unwrap();
        let loaded = store.get_exit_intent("e1").unwrap().unwrap();
        assert_eq!(loaded.status, ExitIntentStatus::Failed);
        assert_eq!(loaded.error_code.as_deref(), Some("TIMEOUT"));
    }
}
