// =============================================================================
// Exit pipeline — qualification and order placement for exit intents
// =============================================================================
//
// Qualification mirrors entry validation for the exit leg. The executor
// claims an intent with a DB-level APPROVED -> PLACED compare-and-set before
// touching the broker, so duplicate processors cannot both place; the trade
// flips OPEN -> EXITING only after the broker acknowledged.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::broker::{AdapterRegistry, BrokerError, OrderRequest};
use crate::events::{EngineEvent, EventBus};
use crate::models::ExitIntent;
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::{ExitIntentStatus, TradeStatus, Validity};

// ---------------------------------------------------------------------------
// Qualification
// ---------------------------------------------------------------------------

pub struct ExitQualification {
    store: Arc<Store>,
    registry: Arc<AdapterRegistry>,
}

impl ExitQualification {
    pub fn new(store: Arc<Store>, registry: Arc<AdapterRegistry>) -> Arc<Self> {
        Arc::new(Self { store, registry })
    }

    /// One pass over PENDING exit intents: each goes APPROVED or REJECTED.
    pub async fn poll_once(&self) -> Result<usize> {
        let pending = self
            .store
            .list_exit_intents_by_status(ExitIntentStatus::Pending)?;
        let mut processed = 0usize;
        for intent in pending {
            match self.qualify(&intent) {
                Ok(approved) => {
                    processed += 1;
                    debug!(exit_intent_id = %intent.id, approved, "exit intent qualified");
                }
                Err(e) => {
                    warn!(exit_intent_id = %intent.id, error = %e, "exit qualification errored");
                }
            }
        }
        Ok(processed)
    }

    fn qualify(&self, intent: &ExitIntent) -> Result<bool> {
        let reject = |reason: &str| -> Result<bool> {
            warn!(exit_intent_id = %intent.id, reason, "exit intent rejected");
            self.store.cas_exit_intent_status(
                &intent.id,
                ExitIntentStatus::Pending,
                ExitIntentStatus::Rejected,
            )?;
            Ok(false)
        };

        let Some(trade) = self.store.get_trade(&intent.trade_id)? else {
            return reject("trade missing");
        };
        if trade.status != TradeStatus::Open {
            return reject("trade is not open");
        }
        if intent.calculated_qty <= 0 || intent.calculated_qty > trade.entry_qty {
            return reject("quantity exceeds open position");
        }
        if self.registry.get(&trade.user_broker_id).is_none() {
            return reject("broker not connected");
        }
        let Some(user_broker) = self.store.get_user_broker(&trade.user_broker_id)? else {
            return reject("user broker missing");
        };
        if user_broker.product_type != intent.product_type {
            return reject("product type mismatch");
        }
        if let Some(active) = self.store.find_active_exit_intent(&trade.id)? {
            if active.id != intent.id {
                return reject("another exit already in flight");
            }
        }

        Ok(self.store.cas_exit_intent_status(
            &intent.id,
            ExitIntentStatus::Pending,
            ExitIntentStatus::Approved,
        )?)
    }
}

impl std::fmt::Debug for ExitQualification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitQualification").finish()
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Outcome of one exit intent attempt, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPlacementOutcome {
    Placed { broker_order_id: String },
    Failed { code: String },
    /// Claim lost or transient refusal; retried next cycle.
    Skipped(&'static str),
}

pub struct ExitOrderExecutor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    coordinator: Arc<TradeCoordinator>,
}

impl ExitOrderExecutor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        registry: Arc<AdapterRegistry>,
        coordinator: Arc<TradeCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            coordinator,
        })
    }

    /// One pass over APPROVED exit intents.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let approved = self
            .store
            .list_exit_intents_by_status(ExitIntentStatus::Approved)?;
        let mut processed = 0usize;
        for intent in approved {
            match self.place_exit(&intent).await {
                Ok(outcome) => {
                    processed += 1;
                    debug!(exit_intent_id = %intent.id, outcome = ?outcome, "exit intent placed");
                }
                Err(e) => {
                    warn!(exit_intent_id = %intent.id, error = %e, "exit placement errored");
                    self.bus
                        .push_error("EXECUTION_ERROR", format!("exit intent {}: {e}", intent.id));
                }
            }
        }
        Ok(processed)
    }

    pub async fn place_exit(self: &Arc<Self>, intent: &ExitIntent) -> Result<ExitPlacementOutcome> {
        let Some(trade) = self.store.get_trade(&intent.trade_id)? else {
            self.store
                .fail_exit_intent(&intent.id, "EXECUTION_ERROR", "trade missing")?;
            return Ok(ExitPlacementOutcome::Failed {
                code: "EXECUTION_ERROR".into(),
            });
        };
        let Some(adapter) = self.registry.get(&trade.user_broker_id) else {
            debug!(exit_intent_id = %intent.id, "no adapter — deferring exit");
            return Ok(ExitPlacementOutcome::Skipped("NO_ADAPTER"));
        };

        // Claim the intent; a duplicate processor loses here and walks away.
        if !self.store.cas_exit_intent_status(
            &intent.id,
            ExitIntentStatus::Approved,
            ExitIntentStatus::Placed,
        )? {
            return Ok(ExitPlacementOutcome::Skipped("CLAIM_LOST"));
        }

        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            exchange: "NSE".to_string(),
            // Exits reverse the entry side.
            transaction_type: trade.direction.reversed(),
            order_type: intent.order_type,
            product_type: intent.product_type,
            quantity: intent.calculated_qty,
            price: intent.limit_price,
            trigger_price: None,
            validity: Validity::Day,
            tag: intent.id.clone(),
        };

        match adapter.place_order(&request).await {
            Ok(placed) => {
                self.store
                    .set_exit_intent_broker_order(&intent.id, &placed.order_id)?;
                self.coordinator
                    .begin_exit(&trade.id, &placed.order_id)
                    .await?;
                info!(
                    exit_intent_id = %intent.id,
                    trade_id = %trade.id,
                    broker_order_id = %placed.order_id,
                    "exit order placed"
                );
                self.bus.publish(EngineEvent::ExitIntentPlaced {
                    exit_intent_id: intent.id.clone(),
                    trade_id: trade.id.clone(),
                    broker_order_id: placed.order_id.clone(),
                });
                Ok(ExitPlacementOutcome::Placed {
                    broker_order_id: placed.order_id,
                })
            }
            Err(BrokerError::RateLimited(msg)) => {
                // Nothing reached the broker; release the claim for the next
                // cycle.
                self.store.cas_exit_intent_status(
                    &intent.id,
                    ExitIntentStatus::Placed,
                    ExitIntentStatus::Approved,
                )?;
                debug!(exit_intent_id = %intent.id, msg, "exit placement rate limited");
                Ok(ExitPlacementOutcome::Skipped("RATE_LIMIT"))
            }
            Err(e) => {
                let (code, message) = e.rejection_payload();
                warn!(
                    exit_intent_id = %intent.id,
                    trade_id = %trade.id,
                    code = %code,
                    "exit order failed at placement"
                );
                self.store.fail_exit_intent(&intent.id, &code, &message)?;
                // The trade stays OPEN; the exit service re-evaluates.
                self.bus.publish(EngineEvent::ExitIntentFailed {
                    exit_intent_id: intent.id.clone(),
                    trade_id: trade.id.clone(),
                    reason: code.clone(),
                });
                Ok(ExitPlacementOutcome::Failed { code })
            }
        }
    }
}

impl std::fmt::Debug for ExitOrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitOrderExecutor").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use crate::trade_coordinator::tests::test_intent;
    use crate::types::{
        now_ms, Direction, ExitReason, OrderType, ProductType, UserBrokerRole, UserBrokerState,
    };
    use crate::validation::tests::test_signal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    pub(crate) struct PipelineFixture {
        pub store: Arc<Store>,
        pub bus: Arc<EventBus>,
        pub registry: Arc<AdapterRegistry>,
        pub coordinator: Arc<TradeCoordinator>,
        pub mock: Arc<MockBroker>,
        pub qualification: Arc<ExitQualification>,
        pub executor: Arc<ExitOrderExecutor>,
    }

    pub(crate) async fn pipeline_fixture() -> PipelineFixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(AdapterRegistry::new());
        let mock = MockBroker::new();
        registry.register("ub1", mock.clone());
        store
            .upsert_user_broker(&crate::models::UserBroker {
                id: "ub1".into(),
                user_id: "u1".into(),
                broker_id: "b1".into(),
                role: UserBrokerRole::Exec,
                state: UserBrokerState::Connected,
                paused: false,
                allowed_symbols: vec!["SBIN".into()],
                product_type: ProductType::Cnc,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();

        let coordinator = TradeCoordinator::new(
            store.clone(),
            bus.clone(),
            Arc::new(EngineConfig::default()),
        );
        let qualification = ExitQualification::new(store.clone(), registry.clone());
        let executor = ExitOrderExecutor::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            coordinator.clone(),
        );
        PipelineFixture {
            store,
            bus,
            registry,
            coordinator,
            mock,
            qualification,
            executor,
        }
    }

    pub(crate) async fn seeded_open_trade(fx: &PipelineFixture) -> crate::models::Trade {
        let trade = fx
            .coordinator
            .create_trade(&test_intent("i1"), &test_signal(), "p1")
            .await
            .unwrap();
        fx.coordinator.mark_pending(&trade.id, "BRK1").await.unwrap();
        fx.coordinator
            .open_on_fill(&trade.id, dec!(502.50), 20)
            .await
            .unwrap()
    }

    pub(crate) fn pending_exit_intent(trade_id: &str, qty: i64) -> ExitIntent {
        let now = now_ms();
        ExitIntent {
            id: Uuid::new_v4().to_string(),
            trade_id: trade_id.into(),
            user_broker_id: "ub1".into(),
            exit_reason: ExitReason::TargetHit,
            calculated_qty: qty,
            order_type: OrderType::Market,
            limit_price: None,
            product_type: ProductType::Cnc,
            status: crate::types::ExitIntentStatus::Pending,
            broker_order_id: None,
            error_code: None,
            error_message: None,
            created_at: now,
            placed_at: None,
            filled_at: None,
            updated_at: now,
            version: 1,
        }
    }

    #[tokio::test]
    async fn qualification_approves_valid_intent() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();

        fx.qualification.poll_once().await.unwrap();
        let loaded = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExitIntentStatus::Approved);
    }

    #[tokio::test]
    async fn qualification_rejects_oversized_or_mismatched() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;

        let oversized = pending_exit_intent(&trade.id, 50);
        fx.store.insert_exit_intent(&oversized).unwrap();
        fx.qualification.poll_once().await.unwrap();
        assert_eq!(
            fx.store.get_exit_intent(&oversized.id).unwrap().unwrap().status,
            ExitIntentStatus::Rejected
        );

        let mut mismatched = pending_exit_intent(&trade.id, 20);
        mismatched.product_type = ProductType::Mis;
        fx.store.insert_exit_intent(&mismatched).unwrap();
        fx.qualification.poll_once().await.unwrap();
        assert_eq!(
            fx.store.get_exit_intent(&mismatched.id).unwrap().unwrap().status,
            ExitIntentStatus::Rejected
        );
    }

    #[tokio::test]
    async fn placement_claims_places_and_flips_trade_to_exiting() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();

        let loaded = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        let outcome = fx.executor.place_exit(&loaded).await.unwrap();
        let broker_order_id = match outcome {
            ExitPlacementOutcome::Placed { broker_order_id } => broker_order_id,
            other => panic!("unexpected outcome {other:?}"),
        };

        let loaded = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExitIntentStatus::Placed);
        assert_eq!(loaded.broker_order_id.as_deref(), Some(broker_order_id.as_str()));
        assert!(loaded.placed_at.is_some());

        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Exiting);

        // The exit order reversed the side and carried the intent id tag.
        let placed = fx.mock.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].transaction_type, Direction::Sell);
        assert_eq!(placed[0].tag, intent.id);
    }

    #[tokio::test]
    async fn duplicate_processors_cannot_both_place() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();
        let approved = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();

        let first = fx.executor.place_exit(&approved).await.unwrap();
        assert!(matches!(first, ExitPlacementOutcome::Placed { .. }));
        let second = fx.executor.place_exit(&approved).await.unwrap();
        assert_eq!(second, ExitPlacementOutcome::Skipped("CLAIM_LOST"));
        assert_eq!(fx.mock.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn broker_rejection_fails_intent_and_keeps_trade_open() {
        let fx = pipeline_fixture().await;
        let trade = seeded_open_trade(&fx).await;
        let intent = pending_exit_intent(&trade.id, 20);
        fx.store.insert_exit_intent(&intent).unwrap();
        fx.qualification.poll_once().await.unwrap();
        let approved = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();

        fx.mock.script_place_result(Err(BrokerError::Rejected {
            code: "RMS:SCRIP_BAN".into(),
            message: "scrip in ban list".into(),
        }));
        let outcome = fx.executor.place_exit(&approved).await.unwrap();
        assert_eq!(
            outcome,
            ExitPlacementOutcome::Failed {
                code: "RMS:SCRIP_BAN".into()
            }
        );

        let loaded = fx.store.get_exit_intent(&intent.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExitIntentStatus::Failed);
        // The trade never left OPEN, so the exit service can retry.
        let trade = fx.store.get_trade(&trade.id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
    }
}
