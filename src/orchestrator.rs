// =============================================================================
// Execution Orchestrator — turns CREATED deliveries into trade intents
// =============================================================================
//
// Periodic poll. Each delivery loads its signal, user-broker and portfolio
// context, runs the validation pipeline, and writes the resulting intent in
// the same transaction that flips the delivery to CONSUMED — the at-most-once
// consumption invariant. Fan-out across deliveries is parallel; one
// (symbol, user) pair is serialised by the partition pool.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::AdapterRegistry;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::models::{SignalDelivery, TradeIntent};
use crate::partitions::PartitionPool;
use crate::store::Store;
use crate::types::{now_ms, DeliveryStatus, IntentStatus, UserBrokerState};
use crate::validation::Validator;

/// What one delivery produced, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    IntentApproved(String),
    IntentRejected(String),
    /// Signal, user-broker or portfolio context missing.
    DeliveryRejected,
    /// A concurrent worker consumed it first.
    LostRace,
}

pub struct ExecutionOrchestrator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<AdapterRegistry>,
    validator: Arc<Validator>,
    partitions: PartitionPool,
}

impl ExecutionOrchestrator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        config: Arc<EngineConfig>,
        registry: Arc<AdapterRegistry>,
        validator: Arc<Validator>,
    ) -> Arc<Self> {
        let partitions = PartitionPool::new("orchestrator", config.partitions);
        Arc::new(Self {
            store,
            bus,
            registry,
            validator,
            partitions,
        })
    }

    /// One polling cycle over all CREATED deliveries.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let deliveries = self.store.list_deliveries_by_status(DeliveryStatus::Created)?;
        if deliveries.is_empty() {
            return Ok(0);
        }
        debug!(count = deliveries.len(), "processing created deliveries");

        let mut jobs = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            // Serialise within one (symbol, user) pair.
            let key = match self.store.get_signal(&delivery.signal_id)? {
                Some(signal) => format!("{}:{}", signal.symbol, delivery.user_id),
                None => delivery.id.clone(),
            };
            let this = self.clone();
            jobs.push(self.partitions.run_on(&key, async move {
                this.process_delivery(&delivery)
            }));
        }

        let mut processed = 0usize;
        for result in futures_util::future::join_all(jobs).await {
            match result {
                Ok(outcome) => {
                    processed += 1;
                    debug!(outcome = ?outcome, "delivery processed");
                }
                Err(e) => {
                    warn!(error = %e, "delivery processing failed");
                    self.bus
                        .push_error("EXECUTION_ERROR", format!("delivery processing: {e}"));
                }
            }
        }
        Ok(processed)
    }

    /// Validate one delivery and consume it atomically with its intent.
    pub fn process_delivery(&self, delivery: &SignalDelivery) -> Result<DeliveryOutcome> {
        let Some(signal) = self.store.get_signal(&delivery.signal_id)? else {
            warn!(delivery_id = %delivery.id, "delivery references missing signal");
            self.store
                .mark_delivery_status(&delivery.id, DeliveryStatus::Rejected)?;
            return Ok(DeliveryOutcome::DeliveryRejected);
        };
        let Some(user_broker) = self.store.get_user_broker(&delivery.user_broker_id)? else {
            warn!(delivery_id = %delivery.id, "delivery references missing user broker");
            self.store
                .mark_delivery_status(&delivery.id, DeliveryStatus::Rejected)?;
            return Ok(DeliveryOutcome::DeliveryRejected);
        };
        let Some(portfolio) = self.store.find_portfolio_by_user(&delivery.user_id)? else {
            warn!(delivery_id = %delivery.id, user_id = %delivery.user_id, "no portfolio for user");
            self.store
                .mark_delivery_status(&delivery.id, DeliveryStatus::Rejected)?;
            return Ok(DeliveryOutcome::DeliveryRejected);
        };

        let adapter_connected = self.registry.get(&user_broker.id).is_some()
            && user_broker.state == UserBrokerState::Connected;
        let outcome = self
            .validator
            .validate(&signal, &user_broker, &portfolio, adapter_connected);

        let now = now_ms();
        let intent = TradeIntent {
            intent_id: Uuid::new_v4().to_string(),
            signal_id: signal.id.clone(),
            user_id: delivery.user_id.clone(),
            broker_id: user_broker.broker_id.clone(),
            user_broker_id: user_broker.id.clone(),
            validation_passed: outcome.passed,
            errors: outcome.errors.clone(),
            calculated_qty: outcome.calculated_qty,
            calculated_value: outcome.calculated_value,
            order_type: outcome.order_type,
            limit_price: outcome.limit_price,
            product_type: outcome.product_type,
            log_impact: outcome.log_impact,
            portfolio_exposure_after: outcome.portfolio_exposure_after,
            status: if outcome.passed {
                IntentStatus::Approved
            } else {
                IntentStatus::Rejected
            },
            created_at: now,
            updated_at: now,
            version: 1,
        };

        if !self.store.consume_delivery_with_intent(&delivery.id, &intent)? {
            debug!(delivery_id = %delivery.id, "delivery already consumed by another worker");
            return Ok(DeliveryOutcome::LostRace);
        }

        if outcome.passed {
            info!(
                intent_id = %intent.intent_id,
                signal_id = %signal.id,
                user_broker_id = %user_broker.id,
                qty = intent.calculated_qty,
                "intent approved"
            );
            self.bus.publish(EngineEvent::IntentApproved {
                intent_id: intent.intent_id.clone(),
                signal_id: signal.id,
                user_broker_id: user_broker.id,
            });
            Ok(DeliveryOutcome::IntentApproved(intent.intent_id))
        } else {
            info!(
                intent_id = %intent.intent_id,
                signal_id = %signal.id,
                user_broker_id = %user_broker.id,
                errors = intent.errors.len(),
                "intent rejected"
            );
            self.bus.publish(EngineEvent::IntentRejected {
                intent_id: intent.intent_id.clone(),
                signal_id: signal.id,
                user_broker_id: user_broker.id,
                errors: intent.errors.clone(),
            });
            Ok(DeliveryOutcome::IntentRejected(intent.intent_id))
        }
    }
}

impl std::fmt::Debug for ExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOrchestrator").finish()
    }
}
