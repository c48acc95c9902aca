// =============================================================================
// Signal delivery persistence — including the atomic consumption path
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_enum, col_enum_opt, dec_sql, dec_sql_opt, json_sql, Store};
use crate::models::{SignalDelivery, TradeIntent};
use crate::types::{now_ms, DeliveryStatus};

const DELIVERY_COLS: &str = "id, signal_id, user_broker_id, user_id, status, intent_id, \
     user_action, created_at, updated_at, deleted_at, version";

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<SignalDelivery> {
    Ok(SignalDelivery {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        user_broker_id: row.get(2)?,
        user_id: row.get(3)?,
        status: col_enum(row, 4)?,
        intent_id: row.get(5)?,
        user_action: col_enum_opt(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        deleted_at: row.get(9)?,
        version: row.get(10)?,
    })
}

impl Store {
    pub fn insert_delivery(&self, delivery: &SignalDelivery) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signal_deliveries (id, signal_id, user_broker_id, user_id, status, \
                 intent_id, user_action, created_at, updated_at, deleted_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    delivery.id,
                    delivery.signal_id,
                    delivery.user_broker_id,
                    delivery.user_id,
                    delivery.status.as_str(),
                    delivery.intent_id,
                    delivery.user_action.map(|a| a.as_str()),
                    delivery.created_at,
                    delivery.updated_at,
                    delivery.deleted_at,
                    delivery.version,
                ],
            )
            .context("failed to insert signal delivery")?;
            Ok(())
        })
    }

    pub fn get_delivery(&self, id: &str) -> Result<Option<SignalDelivery>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLS} FROM signal_deliveries WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], delivery_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_deliveries_by_status(&self, status: DeliveryStatus) -> Result<Vec<SignalDelivery>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLS} FROM signal_deliveries \
                 WHERE status = ?1 AND deleted_at IS NULL ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], delivery_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Transition a delivery to a non-consumed status.
    pub fn mark_delivery_status(&self, id: &str, status: DeliveryStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE signal_deliveries SET status = ?1, updated_at = ?2, \
                 version = version + 1 WHERE id = ?3 AND deleted_at IS NULL",
                params![status.as_str(), now_ms(), id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Expire all still-CREATED deliveries of a signal (supersession/expiry).
    pub fn expire_created_deliveries(&self, signal_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE signal_deliveries SET status = 'EXPIRED', updated_at = ?1, \
                 version = version + 1 WHERE signal_id = ?2 AND status = 'CREATED'",
                params![now_ms(), signal_id],
            )?;
            Ok(updated)
        })
    }

    /// At-most-once consumption: transition the delivery CREATED -> CONSUMED
    /// and insert the consuming trade intent in a single transaction.
    ///
    /// Returns `false` (with nothing written) when the delivery was not in
    /// CREATED — a concurrent worker already consumed it.
    pub fn consume_delivery_with_intent(
        &self,
        delivery_id: &str,
        intent: &TradeIntent,
    ) -> Result<bool> {
        let errors = json_sql(&intent.errors)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction().context("failed to begin transaction")?;

            let claimed = tx.execute(
                "UPDATE signal_deliveries SET status = 'CONSUMED', intent_id = ?1, \
                 updated_at = ?2, version = version + 1 \
                 WHERE id = ?3 AND status = 'CREATED' AND deleted_at IS NULL",
                params![intent.intent_id, now_ms(), delivery_id],
            )?;
            if claimed == 0 {
                // Not ours to consume; leave everything untouched.
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO trade_intents (intent_id, signal_id, user_id, broker_id, \
                 user_broker_id, validation_passed, errors, calculated_qty, calculated_value, \
                 order_type, limit_price, product_type, log_impact, portfolio_exposure_after, \
                 status, created_at, updated_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    intent.intent_id,
                    intent.signal_id,
                    intent.user_id,
                    intent.broker_id,
                    intent.user_broker_id,
                    intent.validation_passed,
                    errors,
                    intent.calculated_qty,
                    dec_sql(intent.calculated_value),
                    intent.order_type.as_str(),
                    dec_sql_opt(intent.limit_price),
                    intent.product_type.as_str(),
                    dec_sql(intent.log_impact),
                    dec_sql(intent.portfolio_exposure_after),
                    intent.status.as_str(),
                    intent.created_at,
                    intent.updated_at,
                    intent.version,
                ],
            )
            .context("failed to insert trade intent")?;

            tx.commit().context("failed to commit consumption")?;
            Ok(true)
        })
    }
}
