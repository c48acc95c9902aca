// =============================================================================
// Order Executor — places broker orders for approved intents
// =============================================================================
//
// Safety ladder before any order leaves the process: the global trading
// switch, then the adapter's READ-ONLY predicate. The trade row is created
// first (unique on intent_id), the order carries `tag = intent_id`, and the
// intent is flipped APPROVED -> EXECUTED only after the broker acknowledged —
// so a crash at any point leaves a state the next cycle or the reconciler
// completes without a duplicate order.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::broker::{AdapterRegistry, BrokerError, OrderRequest};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::models::TradeIntent;
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::{IntentStatus, TradeStatus, Validity};

/// Outcome of one intent for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Placed { trade_id: String, broker_order_id: String },
    Rejected { trade_id: String, code: String },
    /// Transient refusal; the intent stays APPROVED for the next cycle.
    SkippedThisCycle(&'static str),
    /// A previous run already carried this intent past placement.
    AlreadyExecuted,
    Failed(String),
}

pub struct OrderExecutor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    config: Arc<EngineConfig>,
    registry: Arc<AdapterRegistry>,
    coordinator: Arc<TradeCoordinator>,
}

impl OrderExecutor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        config: Arc<EngineConfig>,
        registry: Arc<AdapterRegistry>,
        coordinator: Arc<TradeCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            config,
            registry,
            coordinator,
        })
    }

    /// One polling cycle over APPROVED intents.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        if !self.config.trading_enabled {
            debug!("trading disabled — executor idle");
            return Ok(0);
        }
        let intents = self.store.list_intents_by_status(IntentStatus::Approved)?;
        let mut processed = 0usize;
        for intent in intents {
            match self.execute_intent(&intent).await {
                Ok(outcome) => {
                    processed += 1;
                    debug!(intent_id = %intent.intent_id, outcome = ?outcome, "intent executed");
                }
                Err(e) => {
                    warn!(intent_id = %intent.intent_id, error = %e, "intent execution errored");
                    self.bus
                        .push_error("EXECUTION_ERROR", format!("intent {}: {e}", intent.intent_id));
                }
            }
        }
        Ok(processed)
    }

    /// Drive one intent through trade creation and order placement.
    pub async fn execute_intent(self: &Arc<Self>, intent: &TradeIntent) -> Result<ExecutionOutcome> {
        let Some(adapter) = self.registry.get(&intent.user_broker_id) else {
            debug!(intent_id = %intent.intent_id, "no adapter registered — skipping");
            return Ok(ExecutionOutcome::SkippedThisCycle("NO_ADAPTER"));
        };
        if !adapter.can_place_orders() {
            // READ-ONLY mode: the feed is stale or the token is missing.
            debug!(intent_id = %intent.intent_id, "adapter in read-only mode — skipping");
            return Ok(ExecutionOutcome::SkippedThisCycle("READ_ONLY"));
        }

        let Some(signal) = self.store.get_signal(&intent.signal_id)? else {
            self.store.cas_intent_status(
                &intent.intent_id,
                IntentStatus::Approved,
                IntentStatus::Failed,
            )?;
            return Ok(ExecutionOutcome::Failed("signal missing".into()));
        };
        let Some(portfolio) = self.store.find_portfolio_by_user(&intent.user_id)? else {
            self.store.cas_intent_status(
                &intent.intent_id,
                IntentStatus::Approved,
                IntentStatus::Failed,
            )?;
            return Ok(ExecutionOutcome::Failed("portfolio missing".into()));
        };

        // Create-or-recover the trade row (unique on intent_id).
        let trade = self
            .coordinator
            .create_trade(intent, &signal, &portfolio.id)
            .await?;

        if trade.status != TradeStatus::Created {
            // A previous run got past placement; reconciliation owns it now.
            self.store.cas_intent_status(
                &intent.intent_id,
                IntentStatus::Approved,
                IntentStatus::Executed,
            )?;
            return Ok(ExecutionOutcome::AlreadyExecuted);
        }

        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            exchange: "NSE".to_string(),
            transaction_type: trade.direction,
            order_type: intent.order_type,
            product_type: intent.product_type,
            quantity: intent.calculated_qty,
            price: intent.limit_price,
            trigger_price: None,
            validity: Validity::Day,
            // The broker-side idempotency handle.
            tag: intent.intent_id.clone(),
        };

        match adapter.place_order(&request).await {
            Ok(placed) => {
                self.coordinator
                    .mark_pending(&trade.id, &placed.order_id)
                    .await?;
                self.store.cas_intent_status(
                    &intent.intent_id,
                    IntentStatus::Approved,
                    IntentStatus::Executed,
                )?;
                info!(
                    trade_id = %trade.id,
                    intent_id = %intent.intent_id,
                    broker_order_id = %placed.order_id,
                    "order placed"
                );
                self.bus.publish(EngineEvent::OrderCreated {
                    trade_id: trade.id.clone(),
                    intent_id: intent.intent_id.clone(),
                    broker_order_id: placed.order_id.clone(),
                });
                Ok(ExecutionOutcome::Placed {
                    trade_id: trade.id,
                    broker_order_id: placed.order_id,
                })
            }
            Err(
                e @ (BrokerError::RateLimited(_)
                | BrokerError::TokenExpired(_)
                | BrokerError::NotAuthenticated(_)),
            ) => {
                // Recoverable without broker-side effects: the session layer
                // or the next cycle handles it. The trade stays CREATED.
                warn!(intent_id = %intent.intent_id, error = %e, "placement deferred");
                Ok(ExecutionOutcome::SkippedThisCycle(e.kind()))
            }
            Err(e) => {
                let (code, message) = match &e {
                    BrokerError::Rejected { .. } | BrokerError::InvalidOrder(_) => {
                        e.rejection_payload()
                    }
                    // Transport faults surface as EXECUTION_ERROR; if the
                    // order actually reached the broker, the reconciler
                    // corrects state from broker truth.
                    other => ("EXECUTION_ERROR".to_string(), other.to_string()),
                };
                warn!(
                    trade_id = %trade.id,
                    intent_id = %intent.intent_id,
                    code = %code,
                    message = %message,
                    "order rejected at placement"
                );
                self.coordinator
                    .mark_rejected(&trade.id, &code, &message)
                    .await?;
                self.store.cas_intent_status(
                    &intent.intent_id,
                    IntentStatus::Approved,
                    IntentStatus::Failed,
                )?;
                self.bus.publish(EngineEvent::OrderRejected {
                    trade_id: trade.id.clone(),
                    intent_id: intent.intent_id.clone(),
                    error_code: code.clone(),
                    error_message: message,
                });
                Ok(ExecutionOutcome::Rejected {
                    trade_id: trade.id,
                    code,
                })
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::broker::PlacedOrder;
    use crate::orchestrator::tests::{fixture, seed_world};
    use crate::signal_coordinator::tests::candidate;
    use crate::types::DeliveryStatus;
    use rust_decimal_macros::dec;

    struct ExecFixture {
        fx: crate::orchestrator::tests::Fixture,
        mock: Arc<MockBroker>,
        coordinator: Arc<TradeCoordinator>,
        executor: Arc<OrderExecutor>,
    }

    async fn exec_fixture(trading_enabled: bool) -> ExecFixture {
        let fx = fixture();
        seed_world(&fx);
        let mock = MockBroker::new();
        fx.registry.register("ub1", mock.clone());

        let mut config = EngineConfig::default();
        config.trading_enabled = trading_enabled;
        let config = Arc::new(config);
        let coordinator =
            TradeCoordinator::new(fx.store.clone(), fx.bus.clone(), config.clone());
        let executor = OrderExecutor::new(
            fx.store.clone(),
            fx.bus.clone(),
            config,
            fx.registry.clone(),
            coordinator.clone(),
        );
        ExecFixture {
            fx,
            mock,
            coordinator,
            executor,
        }
    }

    async fn approved_intent(ex: &ExecFixture) -> TradeIntent {
        ex.fx
            .signals
            .publish_candidate(candidate("SBIN", dec!(500.00)))
            .unwrap();
        ex.fx.orchestrator.poll_once().await.unwrap();
        let delivery = ex
            .fx
            .store
            .list_deliveries_by_status(DeliveryStatus::Consumed)
            .unwrap()
            .remove(0);
        ex.fx
            .store
            .get_intent(delivery.intent_id.as_deref().unwrap())
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_places_and_goes_pending() {
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;

        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        let (trade_id, broker_order_id) = match outcome {
            ExecutionOutcome::Placed { trade_id, broker_order_id } => (trade_id, broker_order_id),
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(broker_order_id, "MOCK-1");

        let trade = ex.fx.store.get_trade(&trade_id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.broker_order_id.as_deref(), Some("MOCK-1"));
        assert_eq!(trade.client_order_id, intent.intent_id);

        let intent = ex.fx.store.get_intent(&intent.intent_id).unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Executed);

        // The broker saw exactly one order with the intent tag.
        assert_eq!(ex.mock.orders_with_tag(&intent.intent_id), 1);
    }

    #[tokio::test]
    async fn broker_rejection_marks_trade_rejected_without_retry() {
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;
        ex.mock.script_place_result(Err(BrokerError::Rejected {
            code: "RMS:MARGIN_SHORTFALL".into(),
            message: "insufficient margin".into(),
        }));

        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        let trade_id = match outcome {
            ExecutionOutcome::Rejected { trade_id, code } => {
                assert_eq!(code, "RMS:MARGIN_SHORTFALL");
                trade_id
            }
            other => panic!("unexpected outcome {other:?}"),
        };

        let trade = ex.fx.store.get_trade(&trade_id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
        assert_eq!(trade.error_code.as_deref(), Some("RMS:MARGIN_SHORTFALL"));

        // FAILED intents never re-poll.
        let intent = ex.fx.store.get_intent(&intent.intent_id).unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(ex.executor.poll_once().await.unwrap(), 0);

        // The delivery stays CONSUMED.
        let consumed = ex
            .fx
            .store
            .list_deliveries_by_status(DeliveryStatus::Consumed)
            .unwrap();
        assert_eq!(consumed.len(), 1);
    }

    #[tokio::test]
    async fn trading_switch_and_read_only_defer_placement() {
        // Global switch off: nothing runs.
        let ex = exec_fixture(false).await;
        let _intent = approved_intent(&ex).await;
        assert_eq!(ex.executor.poll_once().await.unwrap(), 0);
        assert!(ex.mock.placed_orders().is_empty());

        // Switch on but adapter read-only: intent stays APPROVED.
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;
        ex.mock.set_can_place(false);
        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::SkippedThisCycle("READ_ONLY"));
        let intent = ex.fx.store.get_intent(&intent.intent_id).unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Approved);
    }

    #[tokio::test]
    async fn rate_limit_defers_without_mutating_state() {
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;
        ex.mock
            .script_place_result(Err(BrokerError::RateLimited("budget spent".into())));

        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::SkippedThisCycle("RATE_LIMIT"));

        // Intent still approved; trade still CREATED; next cycle retries and
        // the broker still ends up with one tagged order.
        let reloaded = ex.fx.store.get_intent(&intent.intent_id).unwrap().unwrap();
        assert_eq!(reloaded.status, IntentStatus::Approved);

        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { .. }));
    }

    #[tokio::test]
    async fn crash_recovery_never_places_twice() {
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;

        // First run placed successfully, then "crashed" before flipping the
        // intent (simulate by resetting it to APPROVED).
        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { .. }));
        ex.fx
            .store
            .cas_intent_status(&intent.intent_id, IntentStatus::Executed, IntentStatus::Approved)
            .unwrap();

        // Restart re-polls the approved intent: the existing trade row is
        // recovered, no second broker order is placed.
        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::AlreadyExecuted);
        assert_eq!(ex.mock.orders_with_tag(&intent.intent_id), 1);

        let intent = ex.fx.store.get_intent(&intent.intent_id).unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Executed);

        // Keep the coordinator reference alive for the index assertion.
        assert_eq!(ex.coordinator.active_trade_count(), 0);
    }

    #[tokio::test]
    async fn scripted_placed_result_threads_through() {
        let ex = exec_fixture(true).await;
        let intent = approved_intent(&ex).await;
        ex.mock.script_place_result(Ok(PlacedOrder {
            order_id: "BRK1".into(),
        }));
        let outcome = ex.executor.execute_intent(&intent).await.unwrap();
        match outcome {
            ExecutionOutcome::Placed { broker_order_id, .. } => {
                assert_eq!(broker_order_id, "BRK1")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
