// =============================================================================
// Engine Configuration — init-time load, no hot reload
// =============================================================================
//
// Configuration resolves in three layers, last one wins:
//   1. compiled defaults,
//   2. optional JSON overrides file at `$CONFIG_DIR/engine.json`,
//   3. process environment variables (the names recognised below).
//
// Every field has a serde default so an older overrides file missing new
// fields still deserialises.
// =============================================================================

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{BrokerKind, ReleaseReadiness, RunMode};

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_data_feed_broker() -> BrokerKind {
    BrokerKind::Mock
}

fn default_order_broker() -> BrokerKind {
    BrokerKind::Mock
}

fn default_db_url() -> String {
    "conflux.db".to_string()
}

fn default_db_pool_size() -> u32 {
    4
}

fn default_port() -> u16 {
    8080
}

fn default_relay_port() -> u16 {
    8099
}

fn default_ws_batch_flush_ms() -> u64 {
    250
}

fn default_jwt_expiration_hours() -> u64 {
    12
}

fn default_release_readiness() -> ReleaseReadiness {
    ReleaseReadiness::Beta
}

fn default_run_mode() -> RunMode {
    RunMode::Full
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(".")
}

// --- timer defaults ---------------------------------------------------------

fn default_candle_finalizer_secs() -> u64 {
    2
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_exit_reconcile_offset_secs() -> u64 {
    15
}

fn default_signal_sweep_secs() -> u64 {
    60
}

fn default_orchestrator_poll_secs() -> u64 {
    3
}

fn default_executor_poll_secs() -> u64 {
    3
}

fn default_watchdog_secs() -> u64 {
    120
}

fn default_oauth_sweep_secs() -> u64 {
    600
}

fn default_instrument_refresh_time() -> String {
    "08:30".to_string()
}

fn default_pending_timeout_secs() -> u64 {
    600
}

fn default_exit_pending_timeout_secs() -> u64 {
    600
}

fn default_broker_permits() -> usize {
    5
}

fn default_broker_deadline_secs() -> u64 {
    10
}

fn default_refresh_window_secs() -> u64 {
    300
}

fn default_refresh_retry_secs() -> u64 {
    30
}

fn default_tick_short_window_secs() -> u64 {
    2
}

fn default_tick_long_window_secs() -> u64 {
    60
}

fn default_listener_channel_capacity() -> usize {
    4096
}

fn default_signal_ttl_secs() -> u64 {
    4 * 3600
}

fn default_candle_lookback() -> usize {
    200
}

fn default_partitions() -> usize {
    8
}

// --- risk & exit defaults ---------------------------------------------------

fn default_min_p_win() -> Decimal {
    Decimal::new(55, 2) // 0.55
}

fn default_min_kelly() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_min_trade_qty() -> i64 {
    1
}

fn default_min_trade_value() -> Decimal {
    Decimal::new(5_000_00, 2) // 5000.00
}

fn default_max_trade_value() -> Decimal {
    Decimal::new(200_000_00, 2) // 200000.00
}

fn default_max_exposure_ratio() -> Decimal {
    Decimal::new(80, 2) // 0.80 of total capital
}

fn default_max_open_trades() -> i64 {
    10
}

fn default_max_trade_log_loss() -> Decimal {
    Decimal::new(25_000, 6) // 0.025000
}

fn default_max_portfolio_log_loss() -> Decimal {
    Decimal::new(60_000, 6) // 0.060000
}

fn default_daily_loss_limit_ratio() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_weekly_loss_limit_ratio() -> Decimal {
    Decimal::new(6, 2) // 0.06
}

fn default_trailing_activation_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02 = 2%
}

fn default_trailing_distance_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03 = 3%
}

fn default_max_holding_days() -> i64 {
    5
}

fn default_min_profit_r() -> Decimal {
    Decimal::new(5, 1) // 0.5 R
}

fn default_target_r() -> Decimal {
    Decimal::ONE
}

fn default_stretch_r() -> Decimal {
    Decimal::new(15, 1) // 1.5 R
}

/// Process-wide engine configuration. Loaded once at startup; never hot
/// reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Operational gates --------------------------------------------------
    /// When true, the startup gate enforces production API URLs and requires
    /// order execution to be enabled.
    #[serde(default = "default_false")]
    pub production_mode: bool,

    #[serde(default = "default_false")]
    pub order_execution_enabled: bool,

    /// Global safety switch consulted before every new order.
    #[serde(default = "default_false")]
    pub trading_enabled: bool,

    #[serde(default = "default_release_readiness")]
    pub release_readiness: ReleaseReadiness,

    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,

    // --- Brokers ------------------------------------------------------------
    #[serde(default = "default_data_feed_broker")]
    pub data_feed_broker: BrokerKind,

    #[serde(default = "default_order_broker")]
    pub order_broker: BrokerKind,

    // --- Storage ------------------------------------------------------------
    #[serde(default = "default_db_url")]
    pub db_url: String,

    #[serde(default)]
    pub db_user: String,

    #[serde(default)]
    pub db_pass: String,

    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    // --- Gateway collaborator (consumed by the out-of-scope HTTP layer) -----
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_expiration_hours")]
    pub jwt_expiration_hours: u64,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_ws_batch_flush_ms")]
    pub ws_batch_flush_ms: u64,

    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    // --- Tick persistence ---------------------------------------------------
    /// Requires `async_event_writer_enabled`; the gate refuses otherwise.
    #[serde(default = "default_false")]
    pub persist_tick_events: bool,

    #[serde(default = "default_false")]
    pub async_event_writer_enabled: bool,

    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    // --- Timers -------------------------------------------------------------
    #[serde(default = "default_candle_finalizer_secs")]
    pub candle_finalizer_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_exit_reconcile_offset_secs")]
    pub exit_reconcile_offset_secs: u64,

    #[serde(default = "default_signal_sweep_secs")]
    pub signal_sweep_secs: u64,

    #[serde(default = "default_orchestrator_poll_secs")]
    pub orchestrator_poll_secs: u64,

    #[serde(default = "default_executor_poll_secs")]
    pub executor_poll_secs: u64,

    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    #[serde(default = "default_oauth_sweep_secs")]
    pub oauth_sweep_secs: u64,

    /// Local wall-clock time (`HH:MM`, exchange timezone) of the daily
    /// instrument master refresh.
    #[serde(default = "default_instrument_refresh_time")]
    pub instrument_refresh_time: String,

    // --- Broker interaction -------------------------------------------------
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,

    #[serde(default = "default_exit_pending_timeout_secs")]
    pub exit_pending_timeout_secs: u64,

    /// Global per-adapter concurrent broker-call cap.
    #[serde(default = "default_broker_permits")]
    pub broker_permits: usize,

    #[serde(default = "default_broker_deadline_secs")]
    pub broker_deadline_secs: u64,

    /// Token refresh fires at `expires_at - refresh_window`.
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,

    #[serde(default = "default_refresh_retry_secs")]
    pub refresh_retry_secs: u64,

    // --- Tick intake --------------------------------------------------------
    #[serde(default = "default_tick_short_window_secs")]
    pub tick_short_window_secs: u64,

    #[serde(default = "default_tick_long_window_secs")]
    pub tick_long_window_secs: u64,

    #[serde(default = "default_listener_channel_capacity")]
    pub listener_channel_capacity: usize,

    // --- Signals ------------------------------------------------------------
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,

    #[serde(default = "default_candle_lookback")]
    pub candle_lookback: usize,

    /// Actor partition count for signal and trade queues.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Entry signals must carry triple confluence when true.
    #[serde(default = "default_true")]
    pub require_triple_confluence: bool,

    // --- Validation thresholds ----------------------------------------------
    #[serde(default = "default_min_p_win")]
    pub min_p_win: Decimal,

    #[serde(default = "default_min_kelly")]
    pub min_kelly: Decimal,

    #[serde(default = "default_min_trade_qty")]
    pub min_trade_qty: i64,

    #[serde(default = "default_min_trade_value")]
    pub min_trade_value: Decimal,

    #[serde(default = "default_max_trade_value")]
    pub max_trade_value: Decimal,

    #[serde(default = "default_max_exposure_ratio")]
    pub max_exposure_ratio: Decimal,

    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: i64,

    #[serde(default = "default_max_trade_log_loss")]
    pub max_trade_log_loss: Decimal,

    #[serde(default = "default_max_portfolio_log_loss")]
    pub max_portfolio_log_loss: Decimal,

    #[serde(default = "default_daily_loss_limit_ratio")]
    pub daily_loss_limit_ratio: Decimal,

    #[serde(default = "default_weekly_loss_limit_ratio")]
    pub weekly_loss_limit_ratio: Decimal,

    // --- Exit rules ---------------------------------------------------------
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: Decimal,

    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_distance_pct: Decimal,

    #[serde(default = "default_max_holding_days")]
    pub max_holding_days: i64,

    #[serde(default = "default_min_profit_r")]
    pub min_profit_r: Decimal,

    #[serde(default = "default_target_r")]
    pub target_r: Decimal,

    #[serde(default = "default_stretch_r")]
    pub stretch_r: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl EngineConfig {
    /// Resolve configuration: defaults, then the overrides file, then env.
    pub fn load() -> Result<Self> {
        let config_dir = std::env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_dir());

        let overrides = config_dir.join("engine.json");
        let mut config = if overrides.exists() {
            Self::from_file(&overrides)?
        } else {
            Self::default()
        };
        config.config_dir = config_dir;
        config.apply_env();

        info!(
            run_mode = %config.run_mode,
            production_mode = config.production_mode,
            trading_enabled = config.trading_enabled,
            data_feed_broker = %config.data_feed_broker,
            order_broker = %config.order_broker,
            db_url = %config.db_url,
            "engine config resolved"
        );
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config overrides from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config overrides from {}", path.display()))
    }

    /// Apply recognised environment variables on top of the current values.
    fn apply_env(&mut self) {
        env_bool("PRODUCTION_MODE", &mut self.production_mode);
        env_bool("ORDER_EXECUTION_ENABLED", &mut self.order_execution_enabled);
        env_bool("TRADING_ENABLED", &mut self.trading_enabled);
        env_bool("PERSIST_TICK_EVENTS", &mut self.persist_tick_events);
        env_bool(
            "ASYNC_EVENT_WRITER_ENABLED",
            &mut self.async_event_writer_enabled,
        );

        env_parse("DATA_FEED_BROKER", &mut self.data_feed_broker);
        env_parse("ORDER_BROKER", &mut self.order_broker);
        env_parse("RELEASE_READINESS", &mut self.release_readiness);
        env_parse("RUN_MODE", &mut self.run_mode);

        env_string("DB_URL", &mut self.db_url);
        env_string("DB_USER", &mut self.db_user);
        env_string("DB_PASS", &mut self.db_pass);
        env_parse("DB_POOL_SIZE", &mut self.db_pool_size);

        env_string("JWT_SECRET", &mut self.jwt_secret);
        env_parse("JWT_EXPIRATION_HOURS", &mut self.jwt_expiration_hours);
        env_parse("PORT", &mut self.port);
        env_parse("WS_BATCH_FLUSH_MS", &mut self.ws_batch_flush_ms);
        env_parse("RELAY_PORT", &mut self.relay_port);
    }
}

fn env_string(name: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(name) {
        *slot = v;
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            other => warn!(var = name, value = other, "unrecognised boolean env value — ignored"),
        }
    }
}

fn env_parse<T>(name: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(v) = std::env::var(name) {
        match v.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn!(var = name, value = %v, error = %e, "unparseable env value — ignored"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert!(!cfg.production_mode);
        assert!(!cfg.trading_enabled);
        assert_eq!(cfg.run_mode, RunMode::Full);
        assert_eq!(cfg.release_readiness, ReleaseReadiness::Beta);
        assert_eq!(cfg.pending_timeout_secs, 600);
        assert_eq!(cfg.reconcile_interval_secs, 30);
        assert_eq!(cfg.exit_reconcile_offset_secs, 15);
        assert_eq!(cfg.broker_permits, 5);
        assert_eq!(cfg.tick_short_window_secs, 2);
        assert_eq!(cfg.tick_long_window_secs, 60);
        assert_eq!(cfg.refresh_window_secs, 300);
        assert_eq!(cfg.trailing_activation_pct, dec!(0.02));
        assert_eq!(cfg.trailing_distance_pct, dec!(0.03));
        assert_eq!(cfg.min_p_win, dec!(0.55));
    }

    #[test]
    fn partial_overrides_fill_defaults() {
        let json = r#"{ "trading_enabled": true, "pending_timeout_secs": 120 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.trading_enabled);
        assert_eq!(cfg.pending_timeout_secs, 120);
        assert_eq!(cfg.reconcile_interval_secs, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.db_url, cfg2.db_url);
        assert_eq!(cfg.max_open_trades, cfg2.max_open_trades);
        assert_eq!(cfg.order_broker, cfg2.order_broker);
    }
}
