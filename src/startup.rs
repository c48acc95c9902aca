// =============================================================================
// Startup Gate — configuration and readiness checks before anything runs
// =============================================================================
//
// Fails the process (no component starts) when production gating is
// inconsistent: production mode without order execution, a broker pointed at
// a non-production API URL, tick persistence without the async writer, or a
// "production ready" declaration while the debt registry still carries an
// unresolved flag. On success it rebuilds the in-memory indexes from
// persistent state.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::models::BrokerRow;
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::ReleaseReadiness;

/// Static debt registry: named gates that must all be true before the
/// engine may declare itself production-ready.
pub const DEBT_REGISTRY: &[(&str, bool)] = &[
    ("ORDER_EXECUTION_IMPLEMENTED", true),
    ("BROKER_RECONCILIATION_RUNNING", true),
    ("TICK_DEDUPLICATION_ACTIVE", true),
    ("EXIT_PIPELINE_IMPLEMENTED", true),
    ("SESSION_REFRESH_IMPLEMENTED", true),
    ("SIGNAL_DEDUPE_ENFORCED", true),
    ("STARTUP_INDEX_REBUILD", true),
];

/// Explicit non-production URL markers, matched against whole host/path
/// segments — never by substring, so "latest" does not trip on "test".
const NON_PRODUCTION_MARKERS: &[&str] = &[
    "sandbox",
    "uat",
    "test",
    "testing",
    "staging",
    "stage",
    "dev",
    "demo",
    "paper",
    "mock",
];

/// Debt flags still set to false.
pub fn unresolved_debt() -> Vec<&'static str> {
    DEBT_REGISTRY
        .iter()
        .filter(|(_, resolved)| !resolved)
        .map(|(name, _)| *name)
        .collect()
}

/// True when any host or path segment of `url` is a known non-production
/// marker.
pub fn is_non_production_url(url: &str) -> bool {
    let without_scheme = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let (host, path) = match without_scheme.split_once('/') {
        Some((host, path)) => (host, path),
        None => (without_scheme, ""),
    };
    let host = host.split(':').next().unwrap_or(host);

    // Hosts break on '.' and '-' (api-test.fyers.in), paths on '/'.
    host.split(|c| c == '.' || c == '-')
        .chain(path.split('/'))
        .any(|segment| NON_PRODUCTION_MARKERS.contains(&segment.to_ascii_lowercase().as_str()))
}

pub struct StartupGate;

impl StartupGate {
    /// Validate configuration against the configured brokers. Every failure
    /// is CONFIG_INVALID and fatal.
    pub fn validate(config: &EngineConfig, brokers: &[BrokerRow]) -> Result<()> {
        if config.production_mode && !config.order_execution_enabled {
            bail!("CONFIG_INVALID: production mode requires order execution to be enabled");
        }

        if config.production_mode {
            for broker in brokers {
                if is_non_production_url(&broker.api_base_url) {
                    bail!(
                        "CONFIG_INVALID: broker {} points at non-production URL {} in production mode",
                        broker.code,
                        broker.api_base_url
                    );
                }
            }
        }

        if config.persist_tick_events && !config.async_event_writer_enabled {
            bail!("CONFIG_INVALID: tick persistence requires the async event writer");
        }

        if config.release_readiness == ReleaseReadiness::ProdReady {
            let unresolved = unresolved_debt();
            if !unresolved.is_empty() {
                bail!(
                    "CONFIG_INVALID: release declared PROD_READY with unresolved debt flags: {}",
                    unresolved.join(", ")
                );
            }
        }

        info!("startup gate checks passed");
        Ok(())
    }

    /// Validate, then rebuild the in-memory indexes from persistent state.
    pub fn run(
        config: &EngineConfig,
        store: &Arc<Store>,
        coordinator: &Arc<TradeCoordinator>,
    ) -> Result<()> {
        let brokers = store.list_brokers()?;
        if let Err(e) = Self::validate(config, &brokers) {
            error!(error = %e, "startup gate refused to start the engine");
            return Err(e);
        }
        let restored = coordinator.rebuild_index()?;
        info!(restored_trades = restored, "startup gate complete");
        Ok(())
    }
}
