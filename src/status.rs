// =============================================================================
// Engine status snapshot + watchdog
// =============================================================================
//
// Assembles one serialisable snapshot of the core's own state: uptime, run
// mode, per-adapter order-placement readiness, feed freshness, active-trade
// counts and the recent-error ring. Published as SYSTEM_STATUS by the
// watchdog task, which also flags a silent feed.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::broker::AdapterRegistry;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::market::TickIntake;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::now_ms;

/// Feed silence beyond this is reported by the watchdog.
const FEED_SILENCE_WARN_MS: i64 = 120_000;

pub struct StatusReporter {
    config: Arc<EngineConfig>,
    bus: Arc<EventBus>,
    intake: Arc<TickIntake>,
    registry: Arc<AdapterRegistry>,
    coordinator: Arc<TradeCoordinator>,
    started_at: Instant,
}

impl StatusReporter {
    pub fn new(
        config: Arc<EngineConfig>,
        bus: Arc<EventBus>,
        intake: Arc<TickIntake>,
        registry: Arc<AdapterRegistry>,
        coordinator: Arc<TradeCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            intake,
            registry,
            coordinator,
            started_at: Instant::now(),
        })
    }

    /// Build the snapshot payload.
    pub fn snapshot(&self) -> serde_json::Value {
        let now = now_ms();
        let adapters: Vec<serde_json::Value> = self
            .registry
            .user_broker_ids()
            .into_iter()
            .map(|user_broker_id| {
                let can_place = self
                    .registry
                    .get(&user_broker_id)
                    .map(|a| a.can_place_orders())
                    .unwrap_or(false);
                json!({
                    "user_broker_id": user_broker_id,
                    "can_place_orders": can_place,
                })
            })
            .collect();

        json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "run_mode": self.config.run_mode.as_str(),
            "trading_enabled": self.config.trading_enabled,
            "feed": {
                "freshest_age_ms": self.intake.ltp_cache().freshest_age_ms(now),
                "accepted_ticks": self.intake.accepted_count(),
                "deduplicated_ticks": self.intake.deduplicated_count(),
                "dropped_ticks": self.intake.ingest_dropped_count(),
            },
            "adapters": adapters,
            "active_trades": self.coordinator.active_trade_count(),
            "recent_errors": self.bus.recent_errors(),
        })
    }

    /// Watchdog pass: publish the snapshot and warn on a silent feed.
    pub fn watchdog_check(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let feed_age = self
            .intake
            .ltp_cache()
            .freshest_age_ms(now_ms());
        match feed_age {
            Some(age) if age > FEED_SILENCE_WARN_MS => {
                warn!(age_ms = age, "watchdog: tick feed is silent");
                self.bus
                    .push_error("STALE_FEED", format!("no tick for {age} ms"));
            }
            Some(age) => {
                info!(age_ms = age, active_trades = self.coordinator.active_trade_count(), "watchdog ok");
            }
            None => {
                // No tick has ever arrived; normal right after start.
                info!("watchdog: no ticks observed yet");
            }
        }
        self.bus.publish(EngineEvent::SystemStatus { snapshot });
        Ok(())
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("uptime_secs", &self.started_at.elapsed().as_secs())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::events::EventBus;
    use crate::market::tests::tick;
    use crate::store::Store;
    use rust_decimal_macros::dec;

    fn reporter() -> (Arc<StatusReporter>, Arc<TickIntake>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let intake = Arc::new(TickIntake::new(2_000, 60_000, 64));
        let registry = Arc::new(AdapterRegistry::new());
        registry.register("ub1", MockBroker::new());
        let coordinator = TradeCoordinator::new(
            Arc::new(Store::open_in_memory().unwrap()),
            bus.clone(),
            Arc::new(EngineConfig::default()),
        );
        let reporter = StatusReporter::new(
            Arc::new(EngineConfig::default()),
            bus.clone(),
            intake.clone(),
            registry,
            coordinator,
        );
        (reporter, intake, bus)
    }

    #[tokio::test]
    async fn snapshot_carries_feed_and_adapter_state() {
        let (reporter, intake, _bus) = reporter();
        intake.handle_tick(tick("SBIN", dec!(500.00), now_ms()));

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot["run_mode"], "FULL");
        assert_eq!(snapshot["feed"]["accepted_ticks"], 1);
        assert_eq!(snapshot["active_trades"], 0);
        let adapters = snapshot["adapters"].as_array().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0]["can_place_orders"], true);
    }

    #[tokio::test]
    async fn watchdog_publishes_system_status() {
        let (reporter, _intake, bus) = reporter();
        let mut rx = bus.subscribe();
        reporter.watchdog_check().unwrap();
        match rx.try_recv().unwrap() {
            EngineEvent::SystemStatus { snapshot } => {
                assert!(snapshot.get("uptime_secs").is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_feed_is_flagged() {
        let (reporter, intake, bus) = reporter();
        intake.handle_tick(tick("SBIN", dec!(500.00), now_ms() - 300_000));
        reporter.watchdog_check().unwrap();
        let errors = bus.recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "STALE_FEED");
    }
}
