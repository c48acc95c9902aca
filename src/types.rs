// =============================================================================
// Shared types used across the Conflux trading engine
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// The exchange trades in Indian Standard Time; signal days and holding-day
/// arithmetic are computed in this offset regardless of the host timezone.
pub fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("valid IST offset")
}

/// Calendar day of `ts` in the exchange timezone, formatted `YYYY-MM-DD`.
pub fn exchange_day(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&exchange_offset())
        .format("%Y-%m-%d")
        .to_string()
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse-failure error shared by every string-backed enum below.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognised {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

str_enum! {
    /// Trade direction; also the broker transaction type.
    Direction {
        Buy => "BUY",
        Sell => "SELL",
    }
}

impl Direction {
    /// The opposite side, used when building exit orders.
    pub fn reversed(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for longs, -1 for shorts; multiplies price deltas into PnL.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

str_enum! {
    /// What kind of opportunity a signal represents.
    SignalType {
        Entry => "ENTRY",
        Exit => "EXIT",
        ScaleIn => "SCALE_IN",
        ScaleOut => "SCALE_OUT",
    }
}

str_enum! {
    /// How many timeframes agree on the zone.
    ConfluenceType {
        None => "NONE",
        Single => "SINGLE",
        Double => "DOUBLE",
        Triple => "TRIPLE",
    }
}

str_enum! {
    /// Signal lifecycle status. A signal is persisted ACTIVE on publication;
    /// SUPERSEDED is set when a newer signal claims the same dedupe key.
    SignalStatus {
        Active => "ACTIVE",
        Expired => "EXPIRED",
        Cancelled => "CANCELLED",
        Superseded => "SUPERSEDED",
    }
}

str_enum! {
    /// Per user-broker delivery of one signal.
    DeliveryStatus {
        Created => "CREATED",
        Delivered => "DELIVERED",
        Consumed => "CONSUMED",
        Expired => "EXPIRED",
        Rejected => "REJECTED",
    }
}

str_enum! {
    /// Operator action recorded against a delivery.
    UserAction {
        Snoozed => "SNOOZED",
        Dismissed => "DISMISSED",
    }
}

str_enum! {
    /// Validated execution candidate status.
    IntentStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Rejected => "REJECTED",
        Executed => "EXECUTED",
        Failed => "FAILED",
    }
}

str_enum! {
    /// Trade status machine: CREATED -> PENDING -> OPEN -> EXITING -> CLOSED,
    /// with REJECTED / TIMEOUT / CANCELLED as terminal side branches.
    TradeStatus {
        Created => "CREATED",
        Pending => "PENDING",
        Open => "OPEN",
        Exiting => "EXITING",
        Closed => "CLOSED",
        Rejected => "REJECTED",
        Timeout => "TIMEOUT",
        Cancelled => "CANCELLED",
    }
}

impl TradeStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rejected | Self::Timeout | Self::Cancelled
        )
    }
}

str_enum! {
    /// Why an exit intent was raised, in evaluation priority order.
    ExitReason {
        StopLoss => "STOP_LOSS",
        TrailingStop => "TRAILING_STOP",
        TargetHit => "TARGET_HIT",
        TimeBased => "TIME_BASED",
        Manual => "MANUAL",
        RiskBreach => "RISK_BREACH",
    }
}

str_enum! {
    /// Exit intent lifecycle.
    ExitIntentStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Rejected => "REJECTED",
        Placed => "PLACED",
        Filled => "FILLED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
}

str_enum! {
    /// Order type sent to brokers.
    OrderType {
        Market => "MARKET",
        Limit => "LIMIT",
        StopLoss => "STOP_LOSS",
    }
}

str_enum! {
    /// Product type; brokers translate via their own tables.
    ProductType {
        Cnc => "CNC",
        Mis => "MIS",
        Nrml => "NRML",
        Mtf => "MTF",
        Bo => "BO",
        Co => "CO",
    }
}

str_enum! {
    /// Order validity.
    Validity {
        Day => "DAY",
        Ioc => "IOC",
        Gtc => "GTC",
    }
}

str_enum! {
    /// Supported broker back-ends.
    BrokerKind {
        Zerodha => "ZERODHA",
        Fyers => "FYERS",
        Upstox => "UPSTOX",
        Dhan => "DHAN",
        Mock => "MOCK",
    }
}

str_enum! {
    /// What a user-broker pairing is used for.
    UserBrokerRole {
        Data => "DATA",
        Exec => "EXEC",
        Both => "BOTH",
    }
}

str_enum! {
    /// Connectivity state of a user-broker session.
    UserBrokerState {
        Connected => "CONNECTED",
        LoginRequired => "LOGIN_REQUIRED",
        Disconnected => "DISCONNECTED",
    }
}

str_enum! {
    /// Internal view of a broker-side order status after mapping the broker's
    /// own status strings.
    BrokerOrderState {
        Filled => "FILLED",
        Pending => "PENDING",
        Placed => "PLACED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
    }
}

str_enum! {
    /// Process run mode. FEED_COLLECTOR starts tick intake and the relay
    /// broadcaster only; all trading components are skipped.
    RunMode {
        Full => "FULL",
        FeedCollector => "FEED_COLLECTOR",
    }
}

str_enum! {
    /// Release-readiness declaration checked by the startup gate.
    ReleaseReadiness {
        Beta => "BETA",
        ProdReady => "PROD_READY",
    }
}

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Candle timeframes the engine aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "25m")]
    M25,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "60m")]
    M60,
    #[serde(rename = "125m")]
    M125,
    #[serde(rename = "DAILY")]
    Daily,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M25,
        Timeframe::M30,
        Timeframe::M60,
        Timeframe::M125,
        Timeframe::Daily,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M25 => "25m",
            Self::M30 => "30m",
            Self::M60 => "60m",
            Self::M125 => "125m",
            Self::Daily => "DAILY",
        }
    }

    /// Bucket width in seconds. DAILY buckets align to the UTC day boundary.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::M25 => 25 * 60,
            Self::M30 => 30 * 60,
            Self::M60 => 60 * 60,
            Self::M125 => 125 * 60,
            Self::Daily => 24 * 60 * 60,
        }
    }

    /// Start of the bucket containing `ts_ms` (epoch milliseconds).
    pub fn bucket_start_ms(&self, ts_ms: i64) -> i64 {
        let width = self.duration_secs() * 1000;
        ts_ms - ts_ms.rem_euclid(width)
    }

    /// End (exclusive) of the bucket containing `ts_ms`.
    pub fn bucket_end_ms(&self, ts_ms: i64) -> i64 {
        self.bucket_start_ms(ts_ms) + self.duration_secs() * 1000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .find(|tf| tf.as_str() == s)
            .copied()
            .ok_or_else(|| ParseEnumError {
                kind: "Timeframe",
                value: s.to_string(),
            })
    }
}
