// =============================================================================
// Persistent entity models
// =============================================================================
//
// Every entity carries string identity, created_at / updated_at epoch-millis
// timestamps, a nullable deleted_at (soft delete) and a monotonically
// incremented version used for optimistic concurrency in the store.
//
// Money and prices are fixed-point `rust_decimal::Decimal`: 2 dp for prices,
// 4 dp for ratios, 6 dp for log-returns. Quantities are integers.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{
    BrokerKind, ConfluenceType, DeliveryStatus, Direction, ExitIntentStatus, ExitReason,
    IntentStatus, OrderType, ProductType, SignalStatus, SignalType, Timeframe, TradeStatus,
    UserAction, UserBrokerRole, UserBrokerState,
};

/// Round to price precision (2 dp).
pub fn round_price(d: Decimal) -> Decimal {
    d.round_dp(2)
}

/// Round to ratio precision (4 dp): probabilities, kelly, scores.
pub fn round_ratio(d: Decimal) -> Decimal {
    d.round_dp(4)
}

/// Round to log-return precision (6 dp).
pub fn round_log(d: Decimal) -> Decimal {
    d.round_dp(6)
}

/// Natural log of a price ratio, as a 6 dp decimal. Returns zero when either
/// operand is non-positive.
pub fn log_return(from: Decimal, to: Decimal) -> Decimal {
    use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
    let (f, t) = match (from.to_f64(), to.to_f64()) {
        (Some(f), Some(t)) if f > 0.0 && t > 0.0 => (f, t),
        _ => return Decimal::ZERO,
    };
    Decimal::from_f64((t / f).ln())
        .map(round_log)
        .unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// MTF zone snapshot
// ---------------------------------------------------------------------------

/// Zone bounds per timeframe tier at the moment the signal was detected.
/// Persisted verbatim as a JSON column on signals and trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MtfZoneSnapshot {
    pub htf_low: Decimal,
    pub htf_high: Decimal,
    pub htf_zone_index: i32,
    pub itf_low: Decimal,
    pub itf_high: Decimal,
    pub itf_zone_index: i32,
    pub ltf_low: Decimal,
    pub ltf_high: Decimal,
    pub ltf_zone_index: i32,
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// One detected opportunity on one symbol. Created and transitioned only by
/// the signal coordinator; deduped on `(symbol, signal_day, signal_type,
/// direction)` while live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub signal_type: SignalType,
    pub status: SignalStatus,
    /// Calendar day in the exchange timezone, `YYYY-MM-DD`.
    pub signal_day: String,
    pub zone: MtfZoneSnapshot,
    pub confluence_type: ConfluenceType,
    pub confluence_score: Decimal,
    pub p_win: Decimal,
    pub p_fill: Decimal,
    pub kelly: Decimal,
    pub ref_price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub entry_low: Decimal,
    pub entry_high: Decimal,
    pub effective_floor: Decimal,
    pub effective_ceiling: Decimal,
    pub reason: String,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

impl Signal {
    /// Live signals hold the dedupe key; everything else has released it.
    pub fn is_live(&self) -> bool {
        self.status == SignalStatus::Active && self.deleted_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Signal delivery
// ---------------------------------------------------------------------------

/// One row per (signal, user-broker) pair produced at fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub id: String,
    pub signal_id: String,
    pub user_broker_id: String,
    pub user_id: String,
    pub status: DeliveryStatus,
    /// Set only when the delivery transitions to CONSUMED, atomically with
    /// the insertion of the consuming trade intent.
    pub intent_id: Option<String>,
    pub user_action: Option<UserAction>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Trade intent
// ---------------------------------------------------------------------------

/// A single failed validation check, preserved on the intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The validated execution candidate. `intent_id` doubles as the broker
/// client tag, making it the idempotency key for order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub intent_id: String,
    pub signal_id: String,
    pub user_id: String,
    pub broker_id: String,
    pub user_broker_id: String,
    pub validation_passed: bool,
    pub errors: Vec<ValidationError>,
    pub calculated_qty: i64,
    pub calculated_value: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: ProductType,
    pub log_impact: Decimal,
    pub portfolio_exposure_after: Decimal,
    pub status: IntentStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// The position. Single-writer: every mutation goes through the trade
/// coordinator, which serialises writes per trade id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub portfolio_id: String,
    pub user_id: String,
    pub broker_id: String,
    pub user_broker_id: String,
    pub signal_id: String,
    /// Unique across all trades: at most one trade row per intent.
    pub intent_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub status: TradeStatus,

    // Entry snapshot.
    pub entry_price: Decimal,
    pub entry_qty: i64,
    pub entry_value: Decimal,
    pub entry_at: Option<i64>,
    pub zone: MtfZoneSnapshot,
    /// Price floor implied by the maximum allowed log loss.
    pub log_loss_floor: Decimal,
    /// Maximum allowed log loss for this trade (positive magnitude).
    pub max_log_loss: Decimal,

    // Derived exit targets.
    pub target_min_profit: Decimal,
    pub target_price: Decimal,
    pub target_stretch: Decimal,
    pub target_primary: Decimal,

    // Live (non-persistent precision) fields.
    pub current_price: Option<Decimal>,
    pub current_log_return: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,

    // Trailing stop.
    pub trailing_active: bool,
    pub trailing_highest_price: Option<Decimal>,
    pub trailing_stop_price: Option<Decimal>,

    // Exit outcome.
    pub exit_price: Option<Decimal>,
    pub exit_at: Option<i64>,
    pub exit_trigger: Option<ExitReason>,
    pub exit_order_id: Option<String>,
    pub realized_pnl: Option<Decimal>,
    pub realized_log_return: Option<Decimal>,
    pub holding_days: Option<i64>,

    // Broker tracking.
    pub broker_order_id: Option<String>,
    /// Equal to `intent_id`; the tag the broker sees.
    pub client_order_id: String,
    pub last_broker_update_at: i64,
    /// Broker error payload captured on rejection.
    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Exit intent
// ---------------------------------------------------------------------------

/// Exit-side analogue of the trade intent, referencing the trade by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitIntent {
    pub id: String,
    pub trade_id: String,
    pub user_broker_id: String,
    pub exit_reason: ExitReason,
    pub calculated_qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: ProductType,
    pub status: ExitIntentStatus,
    pub broker_order_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub placed_at: Option<i64>,
    pub filled_at: Option<i64>,
    pub updated_at: i64,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One finalized OHLCV candle. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

// ---------------------------------------------------------------------------
// OAuth state
// ---------------------------------------------------------------------------

/// DB-persisted OAuth state token so callbacks survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub user_broker_id: String,
    pub broker_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl OAuthState {
    /// Usable iff not used, not deleted, not expired.
    pub fn is_usable(&self, now: i64) -> bool {
        self.used_at.is_none() && self.deleted_at.is_none() && now < self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Broker / user-broker / session / portfolio
// ---------------------------------------------------------------------------

/// A configured external brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRow {
    pub id: String,
    pub code: BrokerKind,
    pub name: String,
    pub api_base_url: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

/// The pairing of one end-user with one brokerage account: the unit that
/// owns credentials, sessions and per-account limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBroker {
    pub id: String,
    pub user_id: String,
    pub broker_id: String,
    pub role: UserBrokerRole,
    pub state: UserBrokerState,
    pub paused: bool,
    pub allowed_symbols: Vec<String>,
    pub product_type: ProductType,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

impl UserBroker {
    /// Eligible to receive signal deliveries.
    pub fn is_exec_eligible(&self, symbol: &str) -> bool {
        matches!(self.role, UserBrokerRole::Exec | UserBrokerRole::Both)
            && self.state == UserBrokerState::Connected
            && !self.paused
            && self.deleted_at.is_none()
            && self.allowed_symbols.iter().any(|s| s == symbol)
    }
}

/// Stored token set for a user-broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub user_broker_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

/// Per-user portfolio context consulted during validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub user_id: String,
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub current_exposure: Decimal,
    pub current_log_exposure: Decimal,
    pub open_trade_count: i64,
    pub daily_loss: Decimal,
    pub weekly_loss: Decimal,
    pub cooldown_until: Option<i64>,
    pub paused: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

/// Normalized instrument master record per `(exchange, trading_symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub exchange: String,
    pub trading_symbol: String,
    pub name: String,
    /// Broker-specific token/mapping payloads keyed by broker code.
    pub broker_tokens: serde_json::Value,
    pub lot_size: i64,
    pub tick_size: Decimal,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
}

/// Watchlist entry; the union of enabled symbols drives tick subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}
