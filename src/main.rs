// =============================================================================
// Conflux Engine — Main Entry Point
// =============================================================================
//
// The composition root. Every component is constructed here and passed by
// reference; there are no process-wide mutable singletons. The startup gate
// runs before anything is spawned and fails the process on misconfiguration.
//
// In FEED_COLLECTOR mode only tick intake and the relay broadcaster start;
// every trading component is skipped.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analytics;
mod broker;
mod config;
mod events;
mod executor;
mod exits;
mod instruments;
mod market;
mod models;
mod orchestrator;
mod partitions;
mod reconcile;
mod relay;
mod scheduler;
mod session;
mod signal_coordinator;
mod startup;
mod status;
mod store;
mod trade_coordinator;
mod types;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analytics::{ConstitutionalSizer, NullAnalytics};
use crate::broker::{build_adapter, AdapterRegistry, BrokerPort};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::exits::pipeline::{ExitOrderExecutor, ExitQualification};
use crate::exits::ExitSignalService;
use crate::instruments::InstrumentService;
use crate::market::candles::{CandleBuilder, HistoryBackfiller};
use crate::market::TickIntake;
use crate::reconcile::{ExitOrderReconciler, PendingOrderReconciler};
use crate::relay::TickRelay;
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::signal_coordinator::SignalCoordinator;
use crate::startup::StartupGate;
use crate::status::StatusReporter;
use crate::store::Store;
use crate::trade_coordinator::TradeCoordinator;
use crate::types::{now_ms, RunMode, Timeframe, UserBrokerRole};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Conflux Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(EngineConfig::load()?);

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let store = Arc::new(Store::open(&config.db_url)?);
    let bus = Arc::new(EventBus::new());
    let intake = Arc::new(TickIntake::new(
        (config.tick_short_window_secs * 1000) as i64,
        (config.tick_long_window_secs * 1000) as i64,
        config.listener_channel_capacity,
    ));

    // ── 3. Broker adapters (one per user-broker) ─────────────────────────
    let registry = Arc::new(AdapterRegistry::new());
    let deadline = Duration::from_secs(config.broker_deadline_secs);
    for user_broker in store.list_user_brokers()? {
        let Some(broker) = store.get_broker(&user_broker.broker_id)? else {
            warn!(user_broker_id = %user_broker.id, "user broker references unknown broker");
            continue;
        };
        let adapter = build_adapter(
            broker.code,
            &broker.api_base_url,
            config.broker_permits,
            deadline,
        );
        registry.register(&user_broker.id, adapter);
    }
    info!(adapters = registry.user_broker_ids().len(), "broker adapters built");

    // ── 4. Trade coordinator + startup gate ──────────────────────────────
    let coordinator = TradeCoordinator::new(store.clone(), bus.clone(), config.clone());
    if let Err(e) = StartupGate::run(&config, &store, &coordinator) {
        error!(error = %e, "startup gate failed — exiting");
        std::process::exit(1);
    }

    // ── 5. Tick intake ───────────────────────────────────────────────────
    let symbols = store.list_enabled_symbols()?;
    info!(symbols = ?symbols, "watchlist symbols");
    let data_adapter = select_data_adapter(&config, &store, &registry, deadline)?;
    if symbols.is_empty() {
        warn!("watchlist is empty — no tick subscription");
    } else {
        let (ingest_tx, _dropped) = intake.ingest_channel();
        if let Err(e) = data_adapter.subscribe_ticks(&symbols, ingest_tx).await {
            warn!(error = %e, "tick subscription failed at startup — watchdog will report");
            bus.push_error(e.kind(), format!("tick subscription: {e}"));
        }
    }

    // ── 6. FEED_COLLECTOR mode: intake + relay only ──────────────────────
    if config.run_mode == RunMode::FeedCollector {
        info!(port = config.relay_port, "FEED_COLLECTOR mode — trading components skipped");
        let relay = TickRelay::new(intake.clone(), config.relay_port);
        tokio::spawn(relay.run());
        tokio::signal::ctrl_c().await?;
        warn!("shutdown signal received — stopping relay");
        return Ok(());
    }

    // ── 7. Session manager ───────────────────────────────────────────────
    let sessions = SessionManager::new(
        store.clone(),
        registry.clone(),
        Duration::from_secs(config.refresh_window_secs),
        Duration::from_secs(config.refresh_retry_secs),
    );
    for user_broker_id in registry.user_broker_ids() {
        if let Err(e) = sessions.start(&user_broker_id).await {
            warn!(user_broker_id = %user_broker_id, error = %e, "session start failed");
        }
    }

    // ── 8. Candle building + backfill ────────────────────────────────────
    let candles = Arc::new(CandleBuilder::new(store.clone(), bus.clone()));
    tokio::spawn(candles.clone().run(intake.subscribe()));

    let backfiller = Arc::new(HistoryBackfiller::new(store.clone(), data_adapter.clone()));
    {
        let backfiller = backfiller.clone();
        let symbols = symbols.clone();
        let lookback = config.candle_lookback;
        tokio::spawn(async move {
            for symbol in &symbols {
                for tf in Timeframe::ALL {
                    if let Err(e) = backfiller
                        .ensure_lookback(symbol, tf, lookback, now_ms())
                        .await
                    {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "lookback backfill failed");
                    }
                }
            }
            info!("startup backfill sweep complete");
        });
    }

    // ── 9. Signal pipeline ───────────────────────────────────────────────
    // The MTF analytics collaborator mounts here; the engine only consumes
    // its SignalCandidate output.
    let analytics = Arc::new(NullAnalytics);
    let signals = SignalCoordinator::new(
        store.clone(),
        bus.clone(),
        config.clone(),
        analytics,
        intake.ltp_cache(),
    );
    tokio::spawn(signals.clone().run_candle_events(bus.subscribe()));

    let sizer = Arc::new(ConstitutionalSizer::new(config.clone()));
    let validator = Arc::new(validation::Validator::new(config.clone(), sizer));
    let orchestrator = orchestrator::ExecutionOrchestrator::new(
        store.clone(),
        bus.clone(),
        config.clone(),
        registry.clone(),
        validator,
    );
    let order_executor = executor::OrderExecutor::new(
        store.clone(),
        bus.clone(),
        config.clone(),
        registry.clone(),
        coordinator.clone(),
    );

    // ── 10. Exit pipeline ────────────────────────────────────────────────
    let exit_service = ExitSignalService::new(store.clone(), config.clone(), coordinator.clone());
    tokio::spawn(exit_service.clone().run(intake.subscribe()));

    let exit_qualification = ExitQualification::new(store.clone(), registry.clone());
    let exit_executor = ExitOrderExecutor::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        coordinator.clone(),
    );

    // ── 11. Reconcilers, instruments, status ─────────────────────────────
    let pending_reconciler = PendingOrderReconciler::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        coordinator.clone(),
        &config,
    );
    let exit_reconciler = ExitOrderReconciler::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        coordinator.clone(),
        &config,
    );
    let instrument_service = InstrumentService::new(store.clone());
    let reporter = StatusReporter::new(
        config.clone(),
        bus.clone(),
        intake.clone(),
        registry.clone(),
        coordinator.clone(),
    );

    // ── 12. Scheduler ────────────────────────────────────────────────────
    let scheduler = Scheduler::new();

    {
        let candles = candles.clone();
        scheduler.spawn_periodic(
            "candle-finalizer",
            Duration::from_secs(config.candle_finalizer_secs),
            Duration::ZERO,
            move || {
                let candles = candles.clone();
                async move {
                    candles.finalize_due(now_ms());
                    Ok(())
                }
            },
        );
    }
    {
        let signals = signals.clone();
        scheduler.spawn_periodic(
            "mtf-signal-sweep",
            Duration::from_secs(config.signal_sweep_secs),
            Duration::ZERO,
            move || {
                let signals = signals.clone();
                async move {
                    signals.expire_due_signals()?;
                    signals.sweep().await
                }
            },
        );
    }
    {
        let orchestrator = orchestrator.clone();
        scheduler.spawn_periodic(
            "execution-orchestrator",
            Duration::from_secs(config.orchestrator_poll_secs),
            Duration::ZERO,
            move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.poll_once().await.map(|_| ()) }
            },
        );
    }
    {
        let order_executor = order_executor.clone();
        scheduler.spawn_periodic(
            "order-executor",
            Duration::from_secs(config.executor_poll_secs),
            Duration::ZERO,
            move || {
                let order_executor = order_executor.clone();
                async move { order_executor.poll_once().await.map(|_| ()) }
            },
        );
    }
    {
        let exit_qualification = exit_qualification.clone();
        scheduler.spawn_periodic(
            "exit-qualification",
            Duration::from_secs(2),
            Duration::ZERO,
            move || {
                let exit_qualification = exit_qualification.clone();
                async move { exit_qualification.poll_once().await.map(|_| ()) }
            },
        );
    }
    {
        let exit_executor = exit_executor.clone();
        scheduler.spawn_periodic(
            "exit-order-executor",
            Duration::from_secs(2),
            Duration::ZERO,
            move || {
                let exit_executor = exit_executor.clone();
                async move { exit_executor.poll_once().await.map(|_| ()) }
            },
        );
    }
    {
        let pending_reconciler = pending_reconciler.clone();
        scheduler.spawn_periodic(
            "pending-order-reconciler",
            Duration::from_secs(config.reconcile_interval_secs),
            Duration::ZERO,
            move || {
                let pending_reconciler = pending_reconciler.clone();
                async move { pending_reconciler.run_once().await.map(|_| ()) }
            },
        );
    }
    {
        let exit_reconciler = exit_reconciler.clone();
        scheduler.spawn_periodic(
            "exit-order-reconciler",
            Duration::from_secs(config.reconcile_interval_secs),
            Duration::from_secs(config.exit_reconcile_offset_secs),
            move || {
                let exit_reconciler = exit_reconciler.clone();
                async move { exit_reconciler.run_once().await.map(|_| ()) }
            },
        );
    }
    {
        let reporter = reporter.clone();
        scheduler.spawn_periodic(
            "watchdog",
            Duration::from_secs(config.watchdog_secs),
            Duration::ZERO,
            move || {
                let reporter = reporter.clone();
                async move { reporter.watchdog_check() }
            },
        );
    }
    {
        let sessions = sessions.clone();
        scheduler.spawn_periodic(
            "oauth-state-sweep",
            Duration::from_secs(config.oauth_sweep_secs),
            Duration::ZERO,
            move || {
                let sessions = sessions.clone();
                async move { sessions.sweep_oauth_states().map(|_| ()) }
            },
        );
    }
    {
        let instrument_service = instrument_service.clone();
        let data_adapter = data_adapter.clone();
        scheduler.spawn_daily_at(
            "instrument-refresh",
            &config.instrument_refresh_time,
            move || {
                let instrument_service = instrument_service.clone();
                let data_adapter = data_adapter.clone();
                async move {
                    instrument_service.refresh_from(&data_adapter).await.map(|_| ())
                }
            },
        );
    }

    info!(
        tasks = scheduler.task_count(),
        "all subsystems running — press Ctrl+C to stop"
    );

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    scheduler.shutdown();
    info!("conflux engine shut down complete");
    Ok(())
}

/// Pick the adapter that feeds ticks and history: the first user-broker with
/// a DATA role on the configured data broker, falling back to a standalone
/// adapter when none is registered.
fn select_data_adapter(
    config: &EngineConfig,
    store: &Arc<Store>,
    registry: &Arc<AdapterRegistry>,
    deadline: Duration,
) -> Result<Arc<dyn BrokerPort>> {
    for user_broker in store.list_user_brokers()? {
        if !matches!(
            user_broker.role,
            UserBrokerRole::Data | UserBrokerRole::Both
        ) {
            continue;
        }
        let Some(broker) = store.get_broker(&user_broker.broker_id)? else {
            continue;
        };
        if broker.code != config.data_feed_broker {
            continue;
        }
        if let Some(adapter) = registry.get(&user_broker.id) {
            info!(user_broker_id = %user_broker.id, broker = %broker.code, "data feed adapter selected");
            return Ok(adapter);
        }
    }

    let base_url = store
        .find_broker_by_code(config.data_feed_broker)?
        .map(|b| b.api_base_url)
        .unwrap_or_default();
    warn!(
        broker = %config.data_feed_broker,
        "no DATA user-broker found — building standalone data adapter"
    );
    Ok(build_adapter(
        config.data_feed_broker,
        &base_url,
        config.broker_permits,
        deadline,
    ))
}
