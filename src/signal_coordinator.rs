// =============================================================================
// Signal Coordinator — single writer for signals and delivery fan-out
// =============================================================================
//
// Invoked on CANDLE_FINALIZED and by the one-minute sweep. Per-symbol
// partitioning keeps processing serial within a symbol while scaling across
// symbols. The dedupe key is (symbol, signal_day, signal_type, direction) in
// the exchange timezone; a matching live signal either swallows the
// candidate (identical evaluation) or is superseded by it (fresh one).
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{SignalAnalytics, SignalCandidate};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::market::LtpCache;
use crate::models::{Signal, SignalDelivery};
use crate::partitions::PartitionPool;
use crate::store::Store;
use crate::types::{
    exchange_day, now_ms, DeliveryStatus, SignalStatus, Timeframe,
};

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Persisted and fanned out to this many user-brokers.
    Published { signal_id: String, deliveries: usize },
    /// An equivalent live signal already holds the dedupe key.
    DuplicateDropped,
    /// A stale live signal held the key and was superseded first.
    Superseded {
        old_signal_id: String,
        new_signal_id: String,
        deliveries: usize,
    },
}

pub struct SignalCoordinator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    config: Arc<EngineConfig>,
    analytics: Arc<dyn SignalAnalytics>,
    ltp: Arc<LtpCache>,
    partitions: PartitionPool,
}

impl SignalCoordinator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        config: Arc<EngineConfig>,
        analytics: Arc<dyn SignalAnalytics>,
        ltp: Arc<LtpCache>,
    ) -> Arc<Self> {
        let partitions = PartitionPool::new("signals", config.partitions);
        Arc::new(Self {
            store,
            bus,
            config,
            analytics,
            ltp,
            partitions,
        })
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// One-minute sweep over every enabled symbol and timeframe.
    pub async fn sweep(self: &Arc<Self>) -> Result<()> {
        let symbols = self.store.list_enabled_symbols()?;
        for symbol in symbols {
            for tf in Timeframe::ALL {
                self.dispatch_evaluation(&symbol, tf);
            }
        }
        Ok(())
    }

    /// Event loop reacting to finalized candles.
    pub async fn run_candle_events(self: Arc<Self>, mut rx: broadcast::Receiver<EngineEvent>) {
        info!("signal coordinator listening for finalized candles");
        loop {
            match rx.recv().await {
                Ok(EngineEvent::CandleFinalized { symbol, timeframe, .. }) => {
                    if let Ok(tf) = Timeframe::from_str(&timeframe) {
                        self.dispatch_evaluation(&symbol, tf);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signal coordinator lagged the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bus closed; signal coordinator stopping");
                    return;
                }
            }
        }
    }

    fn dispatch_evaluation(self: &Arc<Self>, symbol: &str, timeframe: Timeframe) {
        let this = self.clone();
        let symbol = symbol.to_string();
        // Per-symbol serial processing.
        self.partitions.dispatch(&symbol.clone(), async move {
            if let Err(e) = this.evaluate_symbol(&symbol, timeframe) {
                warn!(symbol = %symbol, error = %e, "signal evaluation failed");
                this.bus
                    .push_error("EXECUTION_ERROR", format!("signal eval {symbol}: {e}"));
            }
        });
    }

    fn evaluate_symbol(self: &Arc<Self>, symbol: &str, timeframe: Timeframe) -> Result<()> {
        let now = now_ms();
        let lookback = self.config.candle_lookback as i64;
        let from = now - lookback * timeframe.duration_secs() * 1000;
        let candles = self.store.list_candles(symbol, timeframe, from, now)?;
        let ltp = self.ltp.get(symbol);

        if let Some(candidate) = self.analytics.evaluate(symbol, timeframe, &candles, ltp) {
            self.publish_candidate(candidate)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Publication
    // -------------------------------------------------------------------------

    /// Dedupe, persist, fan out. The serial per-symbol partition makes the
    /// check-then-insert race-free; the partial unique index backs it up.
    pub fn publish_candidate(&self, candidate: SignalCandidate) -> Result<PublishOutcome> {
        let signal_day = exchange_day(Utc::now());
        let existing = self.store.find_live_signal(
            &candidate.symbol,
            &signal_day,
            candidate.signal_type,
            candidate.direction,
        )?;

        if let Some(live) = existing {
            if live.ref_price == candidate.ref_price && live.zone == candidate.zone {
                debug!(
                    symbol = %candidate.symbol,
                    signal_id = %live.id,
                    "duplicate signal dropped"
                );
                return Ok(PublishOutcome::DuplicateDropped);
            }
            // Fresh evaluation for a held key: supersede the old signal and
            // expire its outstanding deliveries before publishing.
            self.store
                .mark_signal_status(&live.id, SignalStatus::Superseded)?;
            let expired = self.store.expire_created_deliveries(&live.id)?;
            info!(
                old_signal_id = %live.id,
                expired_deliveries = expired,
                symbol = %candidate.symbol,
                "signal superseded"
            );
            let (signal_id, deliveries) = self.persist_and_fan_out(candidate, &signal_day)?;
            return Ok(PublishOutcome::Superseded {
                old_signal_id: live.id,
                new_signal_id: signal_id,
                deliveries,
            });
        }

        let (signal_id, deliveries) = self.persist_and_fan_out(candidate, &signal_day)?;
        Ok(PublishOutcome::Published {
            signal_id,
            deliveries,
        })
    }

    fn persist_and_fan_out(
        &self,
        candidate: SignalCandidate,
        signal_day: &str,
    ) -> Result<(String, usize)> {
        let now = now_ms();
        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: candidate.symbol,
            direction: candidate.direction,
            signal_type: candidate.signal_type,
            status: SignalStatus::Active,
            signal_day: signal_day.to_string(),
            zone: candidate.zone,
            confluence_type: candidate.confluence_type,
            confluence_score: candidate.confluence_score.round_dp(4),
            p_win: candidate.p_win.round_dp(4),
            p_fill: candidate.p_fill.round_dp(4),
            kelly: candidate.kelly.round_dp(4),
            ref_price: candidate.ref_price.round_dp(2),
            bid: candidate.bid.round_dp(2),
            ask: candidate.ask.round_dp(2),
            entry_low: candidate.entry_low.round_dp(2),
            entry_high: candidate.entry_high.round_dp(2),
            effective_floor: candidate.effective_floor.round_dp(2),
            effective_ceiling: candidate.effective_ceiling.round_dp(2),
            reason: candidate.reason,
            expires_at: now + (self.config.signal_ttl_secs as i64) * 1000,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        };
        self.store.insert_signal(&signal)?;

        let deliveries = self.fan_out(&signal)?;
        info!(
            signal_id = %signal.id,
            symbol = %signal.symbol,
            direction = %signal.direction,
            deliveries,
            "signal published"
        );
        self.bus.publish(EngineEvent::SignalPublished {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction.as_str().to_string(),
            deliveries,
        });
        Ok((signal.id, deliveries))
    }

    /// One delivery per eligible EXEC user-broker, status CREATED.
    fn fan_out(&self, signal: &Signal) -> Result<usize> {
        let now = now_ms();
        let mut created = 0usize;
        for user_broker in self.store.list_user_brokers()? {
            if !user_broker.is_exec_eligible(&signal.symbol) {
                continue;
            }
            let delivery = SignalDelivery {
                id: Uuid::new_v4().to_string(),
                signal_id: signal.id.clone(),
                user_broker_id: user_broker.id.clone(),
                user_id: user_broker.user_id.clone(),
                status: DeliveryStatus::Created,
                intent_id: None,
                user_action: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
                version: 1,
            };
            self.store.insert_delivery(&delivery)?;
            created += 1;
        }
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    /// Time-driven expiry sweep: ACTIVE signals past `expires_at` go EXPIRED
    /// and their outstanding CREATED deliveries expire with them.
    pub fn expire_due_signals(&self) -> Result<usize> {
        let due = self.store.list_expired_active_signals(now_ms())?;
        let mut expired = 0usize;
        for signal in due {
            if self
                .store
                .mark_signal_status(&signal.id, SignalStatus::Expired)?
            {
                let deliveries = self.store.expire_created_deliveries(&signal.id)?;
                info!(
                    signal_id = %signal.id,
                    symbol = %signal.symbol,
                    expired_deliveries = deliveries,
                    "signal expired"
                );
                expired += 1;
            }
        }
        Ok(expired)
    }
}

impl std::fmt::Debug for SignalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCoordinator")
            .field("partitions", &self.partitions.partition_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analytics::NullAnalytics;
    use crate::models::UserBroker;
    use crate::types::{
        ConfluenceType, Direction, ProductType, SignalType, UserBrokerRole, UserBrokerState,
    };
    use rust_decimal_macros::dec;

    pub(crate) fn candidate(symbol: &str, ref_price: rust_decimal::Decimal) -> SignalCandidate {
        SignalCandidate {
            symbol: symbol.into(),
            direction: Direction::Buy,
            signal_type: SignalType::Entry,
            zone: crate::models::MtfZoneSnapshot {
                htf_low: ref_price - dec!(15),
                htf_high: ref_price + dec!(25),
                htf_zone_index: 2,
                itf_low: ref_price - dec!(10),
                itf_high: ref_price + dec!(20),
                itf_zone_index: 1,
                ltf_low: ref_price - dec!(5),
                ltf_high: ref_price + dec!(15),
                ltf_zone_index: 0,
            },
            confluence_type: ConfluenceType::Triple,
            confluence_score: dec!(0.81),
            p_win: dec!(0.62),
            p_fill: dec!(0.9),
            kelly: dec!(0.08),
            ref_price,
            bid: ref_price - dec!(0.05),
            ask: ref_price + dec!(0.05),
            entry_low: ref_price - dec!(2),
            entry_high: ref_price + dec!(3),
            effective_floor: ref_price - dec!(10),
            effective_ceiling: ref_price + dec!(20),
            reason: "triple confluence zone touch".into(),
        }
    }

    fn seed_user_broker(store: &Store, id: &str, symbols: &[&str]) {
        store
            .upsert_user_broker(&UserBroker {
                id: id.into(),
                user_id: format!("user-{id}"),
                broker_id: "b1".into(),
                role: UserBrokerRole::Exec,
                state: UserBrokerState::Connected,
                paused: false,
                allowed_symbols: symbols.iter().map(|s| s.to_string()).collect(),
                product_type: ProductType::Cnc,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();
    }

    pub(crate) fn coordinator_with_store() -> (Arc<Store>, Arc<SignalCoordinator>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let coord = SignalCoordinator::new(
            store.clone(),
            Arc::new(EventBus::new()),
            Arc::new(EngineConfig::default()),
            Arc::new(NullAnalytics),
            Arc::new(LtpCache::new()),
        );
        (store, coord)
    }

    #[tokio::test]
    async fn publish_fans_out_to_eligible_user_brokers() {
        let (store, coord) = coordinator_with_store();
        seed_user_broker(&store, "ub1", &["SBIN", "INFY"]);
        seed_user_broker(&store, "ub2", &["SBIN"]);
        seed_user_broker(&store, "ub3", &["TCS"]); // not eligible for SBIN

        let outcome = coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        match outcome {
            PublishOutcome::Published { deliveries, .. } => assert_eq!(deliveries, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        let created = store
            .list_deliveries_by_status(DeliveryStatus::Created)
            .unwrap();
        assert_eq!(created.len(), 2);
    }

    #[tokio::test]
    async fn identical_candidate_is_dropped_as_duplicate() {
        let (_store, coord) = coordinator_with_store();
        coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        let second = coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        assert_eq!(second, PublishOutcome::DuplicateDropped);
    }

    #[tokio::test]
    async fn fresh_candidate_supersedes_and_expires_deliveries() {
        let (store, coord) = coordinator_with_store();
        seed_user_broker(&store, "ub1", &["SBIN"]);

        let first = coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        let old_id = match first {
            PublishOutcome::Published { signal_id, .. } => signal_id,
            other => panic!("unexpected outcome {other:?}"),
        };

        // New evaluation at a different reference price claims the key.
        let outcome = coord.publish_candidate(candidate("SBIN", dec!(505.00))).unwrap();
        match outcome {
            PublishOutcome::Superseded {
                old_signal_id,
                new_signal_id,
                deliveries,
            } => {
                assert_eq!(old_signal_id, old_id);
                assert_ne!(new_signal_id, old_id);
                assert_eq!(deliveries, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let old = store.get_signal(&old_id).unwrap().unwrap();
        assert_eq!(old.status, SignalStatus::Superseded);

        // Old delivery expired, new one created.
        let expired = store
            .list_deliveries_by_status(DeliveryStatus::Expired)
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].signal_id, old_id);
        let created = store
            .list_deliveries_by_status(DeliveryStatus::Created)
            .unwrap();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn at_most_one_active_signal_per_key() {
        let (store, coord) = coordinator_with_store();
        coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        coord.publish_candidate(candidate("SBIN", dec!(505.00))).unwrap();
        coord.publish_candidate(candidate("SBIN", dec!(510.00))).unwrap();

        let active = store.list_signals_by_status(SignalStatus::Active).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ref_price, dec!(510.00));
    }

    #[tokio::test]
    async fn expiry_sweep_expires_signal_and_deliveries() {
        let (store, coord) = coordinator_with_store();
        seed_user_broker(&store, "ub1", &["SBIN"]);
        let outcome = coord.publish_candidate(candidate("SBIN", dec!(500.00))).unwrap();
        let signal_id = match outcome {
            PublishOutcome::Published { signal_id, .. } => signal_id,
            other => panic!("unexpected outcome {other:?}"),
        };

        // Nothing due yet.
        assert_eq!(coord.expire_due_signals().unwrap(), 0);

        // Force the expiry into the past.
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE signals SET expires_at = 1 WHERE id = ?1",
                    rusqlite::params![signal_id],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(coord.expire_due_signals().unwrap(), 1);
        let signal = store.get_signal(&signal_id).unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Expired);
        let expired = store
            .list_deliveries_by_status(DeliveryStatus::Expired)
            .unwrap();
        assert_eq!(expired.len(), 1);
    }
}
