// =============================================================================
// Reconciliation — resolve in-flight orders against broker truth
// =============================================================================
//
// For every status with an "in-flight with broker" meaning (trade PENDING,
// exit intent PLACED) the reconcilers either complete the entity from broker
// state or time it out within a bounded window. Broker calls are additionally
// bounded by a global permit semaphore; when no permit is free the entity is
// skipped this cycle, never queued.
//
// Both reconcilers only read broker state; they never cancel or place orders.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::broker::AdapterRegistry;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::{now_ms, BrokerOrderState, ExitIntentStatus, TradeStatus};

/// Counters from one reconciliation pass, surfaced in the status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileStats {
    pub scanned: u32,
    pub filled: u32,
    pub rejected: u32,
    pub cancelled: u32,
    pub timed_out: u32,
    pub still_pending: u32,
    pub rate_limited: u32,
    pub errors: u32,
}

// ---------------------------------------------------------------------------
// Entry-side reconciler
// ---------------------------------------------------------------------------

pub struct PendingOrderReconciler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    coordinator: Arc<TradeCoordinator>,
    permits: Arc<Semaphore>,
    pending_timeout: Duration,
}

impl PendingOrderReconciler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<AdapterRegistry>,
        coordinator: Arc<TradeCoordinator>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            coordinator,
            permits: Arc::new(Semaphore::new(config.broker_permits)),
            pending_timeout: Duration::from_secs(config.pending_timeout_secs),
        })
    }

    /// One pass over all PENDING trades.
    pub async fn run_once(self: &Arc<Self>) -> Result<ReconcileStats> {
        let pending = self.store.list_trades_by_status(TradeStatus::Pending)?;
        let mut stats = ReconcileStats::default();
        let now = now_ms();

        for trade in pending {
            stats.scanned += 1;

            // Timed-out orders transition without a broker call.
            let age_ms = now - trade.last_broker_update_at;
            if age_ms > self.pending_timeout.as_millis() as i64 {
                warn!(
                    trade_id = %trade.id,
                    age_secs = age_ms / 1000,
                    "pending trade exceeded timeout"
                );
                if self.coordinator.mark_timeout(&trade.id).await.is_ok() {
                    stats.timed_out += 1;
                }
                continue;
            }

            // Bounded broker use: no permit means skip, not queue.
            let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
                stats.rate_limited += 1;
                continue;
            };

            let Some(adapter) = self.registry.get(&trade.user_broker_id) else {
                debug!(trade_id = %trade.id, "no adapter for pending trade");
                stats.errors += 1;
                continue;
            };
            let Some(broker_order_id) = trade.broker_order_id.clone() else {
                // Pending without an order id should not exist; only the
                // heartbeat keeps it from timing out silently.
                warn!(trade_id = %trade.id, "pending trade has no broker order id");
                stats.errors += 1;
                continue;
            };

            match adapter.get_order_status(&broker_order_id).await {
                Ok(report) => match report.status {
                    BrokerOrderState::Filled => {
                        let avg = report.avg_price.unwrap_or(trade.entry_price);
                        match self
                            .coordinator
                            .open_on_fill(&trade.id, avg, report.filled_qty)
                            .await
                        {
                            Ok(opened) => {
                                info!(
                                    trade_id = %trade.id,
                                    entry_price = %opened.entry_price,
                                    qty = opened.entry_qty,
                                    "pending trade filled"
                                );
                                stats.filled += 1;
                            }
                            Err(e) => {
                                warn!(trade_id = %trade.id, error = %e, "fill transition failed");
                                stats.errors += 1;
                            }
                        }
                    }
                    BrokerOrderState::Rejected => {
                        let message = report
                            .status_message
                            .unwrap_or_else(|| "rejected by broker".to_string());
                        if self
                            .coordinator
                            .mark_rejected(&trade.id, "BROKER_REJECTED", &message)
                            .await
                            .is_ok()
                        {
                            self.bus.publish(EngineEvent::OrderRejected {
                                trade_id: trade.id.clone(),
                                intent_id: trade.intent_id.clone(),
                                error_code: "BROKER_REJECTED".into(),
                                error_message: message,
                            });
                            stats.rejected += 1;
                        }
                    }
                    BrokerOrderState::Cancelled => {
                        if self.coordinator.mark_cancelled(&trade.id).await.is_ok() {
                            stats.cancelled += 1;
                        }
                    }
                    BrokerOrderState::Pending | BrokerOrderState::Placed => {
                        // Still working at the broker: heartbeat only, no new
                        // version (field-level change detection).
                        self.coordinator.touch_heartbeat(&trade.id)?;
                        stats.still_pending += 1;
                    }
                },
                Err(e) => {
                    warn!(
                        trade_id = %trade.id,
                        error = %e,
                        "broker status query failed"
                    );
                    self.bus
                        .push_error(e.kind(), format!("reconcile trade {}: {e}", trade.id));
                    stats.errors += 1;
                }
            }
        }

        debug!(stats = ?stats, "pending-order reconciliation pass complete");
        Ok(stats)
    }
}

impl std::fmt::Debug for PendingOrderReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOrderReconciler")
            .field("pending_timeout", &self.pending_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Exit-side reconciler
// ---------------------------------------------------------------------------

pub struct ExitOrderReconciler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    coordinator: Arc<TradeCoordinator>,
    permits: Arc<Semaphore>,
    placed_timeout: Duration,
}

impl ExitOrderReconciler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<AdapterRegistry>,
        coordinator: Arc<TradeCoordinator>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            coordinator,
            permits: Arc::new(Semaphore::new(config.broker_permits)),
            placed_timeout: Duration::from_secs(config.exit_pending_timeout_secs),
        })
    }

    /// One pass over all PLACED exit intents.
    pub async fn run_once(self: &Arc<Self>) -> Result<ReconcileStats> {
        let placed = self
            .store
            .list_exit_intents_by_status(ExitIntentStatus::Placed)?;
        let mut stats = ReconcileStats::default();
        let now = now_ms();

        for intent in placed {
            stats.scanned += 1;

            let age_ms = now - intent.placed_at.unwrap_or(intent.created_at);
            if age_ms > self.placed_timeout.as_millis() as i64 {
                warn!(
                    exit_intent_id = %intent.id,
                    age_secs = age_ms / 1000,
                    "placed exit intent exceeded timeout"
                );
                self.store
                    .fail_exit_intent(&intent.id, "TIMEOUT", "no broker update within window")?;
                // Free the trade for a fresh exit attempt.
                let _ = self.coordinator.revert_exit(&intent.trade_id).await;
                self.bus.publish(EngineEvent::ExitIntentFailed {
                    exit_intent_id: intent.id.clone(),
                    trade_id: intent.trade_id.clone(),
                    reason: "TIMEOUT".into(),
                });
                stats.timed_out += 1;
                continue;
            }

            let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
                stats.rate_limited += 1;
                continue;
            };

            let Some(adapter) = self.registry.get(&intent.user_broker_id) else {
                stats.errors += 1;
                continue;
            };
            let Some(broker_order_id) = intent.broker_order_id.clone() else {
                warn!(exit_intent_id = %intent.id, "placed exit intent has no broker order id");
                stats.errors += 1;
                continue;
            };

            match adapter.get_order_status(&broker_order_id).await {
                Ok(report) => match report.status {
                    BrokerOrderState::Filled => {
                        if self.store.cas_exit_intent_status(
                            &intent.id,
                            ExitIntentStatus::Placed,
                            ExitIntentStatus::Filled,
                        )? {
                            let trade = self.store.get_trade(&intent.trade_id)?;
                            let exit_price = report
                                .avg_price
                                .or_else(|| trade.as_ref().map(|t| t.entry_price))
                                .unwrap_or_default();
                            match self
                                .coordinator
                                .close_trade_on_exit_fill(
                                    &intent.trade_id,
                                    exit_price,
                                    report.filled_qty,
                                    intent.exit_reason,
                                    now_ms(),
                                )
                                .await
                            {
                                Ok(closed) => {
                                    info!(
                                        trade_id = %closed.id,
                                        exit_price = %exit_price,
                                        realized_pnl = ?closed.realized_pnl,
                                        holding_days = ?closed.holding_days,
                                        "trade closed on exit fill"
                                    );
                                    stats.filled += 1;
                                }
                                Err(e) => {
                                    warn!(
                                        trade_id = %intent.trade_id,
                                        error = %e,
                                        "close-on-fill transition failed"
                                    );
                                    stats.errors += 1;
                                }
                            }
                            self.bus.publish(EngineEvent::ExitIntentFilled {
                                exit_intent_id: intent.id.clone(),
                                trade_id: intent.trade_id.clone(),
                            });
                        }
                    }
                    BrokerOrderState::Rejected => {
                        let message = report
                            .status_message
                            .unwrap_or_else(|| "rejected by broker".to_string());
                        self.store
                            .fail_exit_intent(&intent.id, "BROKER_REJECTED", &message)?;
                        let _ = self.coordinator.revert_exit(&intent.trade_id).await;
                        self.bus.publish(EngineEvent::ExitIntentFailed {
                            exit_intent_id: intent.id.clone(),
                            trade_id: intent.trade_id.clone(),
                            reason: "BROKER_REJECTED".into(),
                        });
                        stats.rejected += 1;
                    }
                    BrokerOrderState::Cancelled => {
                        if self.store.cas_exit_intent_status(
                            &intent.id,
                            ExitIntentStatus::Placed,
                            ExitIntentStatus::Cancelled,
                        )? {
                            let _ = self.coordinator.revert_exit(&intent.trade_id).await;
                            self.bus.publish(EngineEvent::ExitIntentCancelled {
                                exit_intent_id: intent.id.clone(),
                                trade_id: intent.trade_id.clone(),
                            });
                            stats.cancelled += 1;
                        }
                    }
                    BrokerOrderState::Pending | BrokerOrderState::Placed => {
                        stats.still_pending += 1;
                    }
                },
                Err(e) => {
                    warn!(
                        exit_intent_id = %intent.id,
                        error = %e,
                        "broker status query failed"
                    );
                    self.bus
                        .push_error(e.kind(), format!("reconcile exit {}: {e}", intent.id));
                    stats.errors += 1;
                }
            }
        }

        debug!(stats = ?stats, "exit-order reconciliation pass complete");
        Ok(stats)
    }
}

impl std::fmt::Debug for ExitOrderReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitOrderReconciler")
            .field("placed_timeout", &self.placed_timeout)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerPort;
    use crate::exits::pipeline::tests::{
        pending_exit_intent, pipeline_fixture, seeded_open_trade,
    };
    use rust_decimal_macros::dec;

    async fn entry_reconciler(
        fx: &crate::exits::pipeline::tests::PipelineFixture,
        pending_timeout_secs: u64,
    ) -> Arc<PendingOrderReconciler> {
        let mut config = EngineConfig::default();
        config.pending_timeout_secs = pending_timeout_secs;
        PendingOrderReconciler::new(
            fx.store.clone(),
            fx.bus.clone(),
            fx.registry.clone(),
            fx.coordinator.clone(),
            &config,
        )
    }

    #[tokio::test]
    async fn fill_transitions_pending_to_open_with_broker_truth() {
        let fx = pipeline_fixture().await;
        let trade = fx
            .coordinator
            .create_trade(
                &crate::trade_coordinator::tests::test_intent("i1"),
                &crate::validation::tests::test_signal(),
                "p1",
            )
            .await
            .unwrap();
        // Place through the mock so the reconciler can query it.
        let placed = fx
            .mock
            .place_order(&crate::broker::OrderRequest {
                symbol: "SBIN".into(),
                exchange: "NSE".into(),
                transaction_type: crate::types::Direction::Buy,
                order_type: crate::types::OrderType::Market,
                product_type: crate::types::ProductType::Cnc,
                quantity: 20,
                price: None,
                trigger_price: None,
                validity: crate::types::Validity::Day,
                tag: "i1".into(),
            })
            .await
            .unwrap();
        fx.coordinator
            .mark_pending(&trade.id, &placed.order_id)
            .await
            .unwrap();

        fx.mock
            .set_order_status(&placed.order_id, "COMPLETE", 20, Some(dec!(502.50)));

        let reconciler = entry_reconciler(&fx, 600).await;
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.filled, 1);

        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_price, dec!(502.50));
        assert_eq!(trade.entry_qty, 20);
    }

    #[tokio::test]
    async fn still_pending_only_touches_heartbeat() {
        let fx = pipeline_fixture().await;
        let trade = fx
            .coordinator
            .create_trade(
                &crate::trade_coordinator::tests::test_intent("i1"),
                &crate::validation::tests::test_signal(),
                "p1",
            )
            .await
            .unwrap();
        let placed = fx
            .mock
            .place_order(&crate::broker::OrderRequest {
                symbol: "SBIN".into(),
                exchange: "NSE".into(),
                transaction_type: crate::types::Direction::Buy,
                order_type: crate::types::OrderType::Market,
                product_type: crate::types::ProductType::Cnc,
                quantity: 20,
                price: None,
                trigger_price: None,
                validity: crate::types::Validity::Day,
                tag: "i1".into(),
            })
            .await
            .unwrap();
        let trade = fx
            .coordinator
            .mark_pending(&trade.id, &placed.order_id)
            .await
            .unwrap();
        let version_before = trade.version;

        let reconciler = entry_reconciler(&fx, 600).await;
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.still_pending, 1);

        // Heartbeat refreshed, no new version minted.
        let reloaded = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TradeStatus::Pending);
        assert_eq!(reloaded.version, version_before);
        assert!(reloaded.last_broker_update_at >= trade.last_broker_update_at);
    }

    #[tokio::test]
    async fn timeout_rejects_without_broker_call() {
        let fx = pipeline_fixture().await;
        let trade = fx
            .coordinator
            .create_trade(
                &crate::trade_coordinator::tests::test_intent("i1"),
                &crate::validation::tests::test_signal(),
                "p1",
            )
            .await
            .unwrap();
        fx.coordinator.mark_pending(&trade.id, "GONE").await.unwrap();

        // The broker has been unreachable for 11 minutes.
        fx.store
            .touch_trade_heartbeat(&trade.id, now_ms() - 11 * 60 * 1000)
            .unwrap();
        let reconciler = entry_reconciler(&fx, 600).await;
        let mut rx = fx.bus.subscribe();
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.timed_out, 1);

        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Timeout);
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::OrderTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn exit_fill_closes_trade_with_realized_pnl() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;

        // Raise, qualify and place the exit through the real pipeline.
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();
        let approved = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        fx.executor.place_exit(&approved).await.unwrap();
        let placed = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        let broker_order_id = placed.broker_order_id.clone().unwrap();

        fx.mock
            .set_order_status(&broker_order_id, "COMPLETE", 20, Some(dec!(518.80)));

        let config = EngineConfig::default();
        let reconciler = ExitOrderReconciler::new(
            fx.store.clone(),
            fx.bus.clone(),
            fx.registry.clone(),
            fx.coordinator.clone(),
            &config,
        );
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.filled, 1);

        let intent = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(intent.status, ExitIntentStatus::Filled);
        assert!(intent.filled_at.is_some());

        // (518.80 - 502.50) * 20 = 326.00, same-day close.
        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.realized_pnl, Some(dec!(326.00)));
        assert_eq!(trade.holding_days, Some(0));
        assert_eq!(trade.exit_price, Some(dec!(518.80)));
    }

    #[tokio::test]
    async fn exit_rejection_reverts_trade_to_open() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();
        let approved = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        fx.executor.place_exit(&approved).await.unwrap();
        let placed = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        let broker_order_id = placed.broker_order_id.clone().unwrap();

        fx.mock.set_order_status(&broker_order_id, "REJECTED", 0, None);
        fx.mock
            .set_order_status_message(&broker_order_id, "RMS rejection at exchange");

        let config = EngineConfig::default();
        let reconciler = ExitOrderReconciler::new(
            fx.store.clone(),
            fx.bus.clone(),
            fx.registry.clone(),
            fx.coordinator.clone(),
            &config,
        );
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.rejected, 1);

        let intent = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(intent.status, ExitIntentStatus::Failed);
        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn exit_timeout_fails_intent_and_reverts() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();
        let approved = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        fx.executor.place_exit(&approved).await.unwrap();

        // Backdate the placement so the window has long passed.
        fx.store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE exit_intents SET placed_at = ?1 WHERE id = ?2",
                    rusqlite::params![now_ms() - 11 * 60 * 1000, intent.id],
                )?;
                Ok(())
            })
            .unwrap();

        let config = EngineConfig::default();
        let reconciler = ExitOrderReconciler::new(
            fx.store.clone(),
            fx.bus.clone(),
            fx.registry.clone(),
            fx.coordinator.clone(),
            &config,
        );
        let stats = reconciler.run_once().await.unwrap();
        assert_eq!(stats.timed_out, 1);

        let intent = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(intent.status, ExitIntentStatus::Failed);
        assert_eq!(intent.error_code.as_deref(), Some("TIMEOUT"));
        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
    }
}
