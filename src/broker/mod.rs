// =============================================================================
// Broker port — uniform outbound surface over every external broker
// =============================================================================
//
// Each concrete adapter owns its token (loaded via the session manager), its
// rate limits, a bounded concurrent-call semaphore and its own reconnect/
// backoff for streaming. The port fails with categorical error kinds; the
// broker's own message is always preserved as a string payload.
// =============================================================================

pub mod dhan;
pub mod fyers;
pub mod http;
pub mod mock;
pub mod rate_limit;
pub mod stream;
pub mod upstox;
pub mod zerodha;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::market::Tick;
use crate::models::Candle;
use crate::types::{
    BrokerKind, BrokerOrderState, Direction, OrderType, ProductType, Timeframe, Validity,
};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Channel end handed to `subscribe_ticks`; the adapter pushes parsed ticks
/// into it without blocking its read loop.
pub type TickSender = mpsc::Sender<Tick>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Categorical broker failures. `kind()` yields the stable label used in
/// logs, events and the recent-error buffer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("token expired: {0}")]
    TokenExpired(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker rejected [{code}]: {message}")]
    Rejected { code: String, message: String },
}

impl BrokerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAuthenticated(_) => "NOT_AUTHENTICATED",
            Self::TokenExpired(_) => "TOKEN_EXPIRED",
            Self::RateLimited(_) => "RATE_LIMIT",
            Self::InvalidOrder(_) => "INVALID_ORDER",
            Self::Connection(_) => "CONNECTION",
            Self::Timeout(_) => "TIMEOUT",
            Self::Rejected { .. } => "BROKER_REJECTED",
        }
    }

    /// Rejection code + message for persisting onto the failing entity.
    pub fn rejection_payload(&self) -> (String, String) {
        match self {
            Self::Rejected { code, message } => (code.clone(), message.clone()),
            other => (other.kind().to_string(), other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Credentials handed to `connect`. Which fields matter depends on the
/// broker; unused fields stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// OAuth authorization code / request token from the login redirect.
    pub auth_code: String,
    pub client_id: String,
}

/// Token set returned by `connect` or a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

/// A fully specified outbound order. `tag` carries the intent id — the
/// broker-side idempotency handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub transaction_type: Direction,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: i64,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub validity: Validity,
    pub tag: String,
}

/// Change set for `modify_order`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderChange {
    pub quantity: Option<i64>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub order_type: Option<OrderType>,
}

/// Broker acknowledgement of a placed/modified order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
}

/// Broker-side order status after mapping the broker's status strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub status: BrokerOrderState,
    /// The broker's literal status string before mapping.
    pub raw_status: String,
    pub status_message: Option<String>,
    pub filled_qty: i64,
    pub avg_price: Option<Decimal>,
    pub tag: Option<String>,
    pub symbol: String,
}

/// A position reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub product_type: String,
}

/// A holding reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHolding {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price: Decimal,
}

/// Available funds snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funds {
    pub available: Decimal,
    pub utilised: Decimal,
}

/// One row of a broker's instrument dump, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub exchange: String,
    pub trading_symbol: String,
    pub name: String,
    pub broker_token: serde_json::Value,
    pub lot_size: i64,
    pub tick_size: Decimal,
}

// ---------------------------------------------------------------------------
// Status mapping
// ---------------------------------------------------------------------------

/// Map a broker status string to the internal order state. Unknown strings
/// map to PENDING so the reconciler keeps polling rather than guessing.
pub fn map_broker_status(raw: &str) -> BrokerOrderState {
    match raw.trim().to_ascii_uppercase().as_str() {
        "COMPLETE" | "FILLED" | "TRADED" => BrokerOrderState::Filled,
        "PUT ORDER REQ RECEIVED" | "VALIDATION PENDING" => BrokerOrderState::Placed,
        "OPEN" | "OPEN PENDING" | "TRIGGER PENDING" | "PENDING" => BrokerOrderState::Pending,
        "REJECTED" => BrokerOrderState::Rejected,
        "CANCELLED" | "CANCELED" => BrokerOrderState::Cancelled,
        _ => BrokerOrderState::Pending,
    }
}

// ---------------------------------------------------------------------------
// Product translation
// ---------------------------------------------------------------------------

/// Per-broker product-type translation. MTF is first-class where the broker
/// supports it (Zerodha, Dhan) and downgrades to the broker's margin product
/// elsewhere.
pub fn translate_product(kind: BrokerKind, product: ProductType) -> &'static str {
    match kind {
        BrokerKind::Zerodha | BrokerKind::Mock => product.as_str(),
        BrokerKind::Dhan => match product {
            ProductType::Cnc => "CNC",
            ProductType::Mis => "INTRADAY",
            ProductType::Nrml => "MARGIN",
            ProductType::Mtf => "MTF",
            ProductType::Bo => "BO",
            ProductType::Co => "CO",
        },
        BrokerKind::Fyers => match product {
            ProductType::Cnc => "CNC",
            ProductType::Mis => "INTRADAY",
            ProductType::Nrml | ProductType::Mtf => "MARGIN",
            ProductType::Bo => "BO",
            ProductType::Co => "CO",
        },
        BrokerKind::Upstox => match product {
            ProductType::Cnc => "D",
            ProductType::Mis => "I",
            ProductType::Nrml | ProductType::Mtf => "M",
            ProductType::Bo => "B",
            ProductType::Co => "C",
        },
    }
}

// ---------------------------------------------------------------------------
// The port
// ---------------------------------------------------------------------------

/// Capability set every broker adapter implements.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Exchange login credentials for a session token.
    async fn connect(&self, credentials: &BrokerCredentials) -> BrokerResult<SessionToken>;

    /// Token-refresh fan-out target: replace the cached access token without
    /// reconnecting.
    fn set_access_token(&self, token: &str);

    /// False while the feed is stale or the adapter is unauthenticated; the
    /// order executor refuses new orders when false (READ-ONLY mode).
    fn can_place_orders(&self) -> bool;

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<PlacedOrder>;
    async fn modify_order(&self, order_id: &str, change: &OrderChange)
        -> BrokerResult<PlacedOrder>;
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;
    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderStatusReport>;
    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>>;
    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;
    async fn list_holdings(&self) -> BrokerResult<Vec<BrokerHolding>>;
    async fn get_funds(&self) -> BrokerResult<Funds>;
    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal>;

    /// Start streaming ticks for `symbols` into `listener`. The adapter owns
    /// reconnect/backoff; it marks itself stale when the stream is down.
    async fn subscribe_ticks(&self, symbols: &[String], listener: TickSender)
        -> BrokerResult<()>;
    async fn unsubscribe_ticks(&self, symbols: &[String]) -> BrokerResult<()>;

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> BrokerResult<Vec<Candle>>;

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>>;
}

// ---------------------------------------------------------------------------
// Adapter factory
// ---------------------------------------------------------------------------

/// Build one adapter for a broker kind. Credentials come from the process
/// environment; the API base URL comes from the broker's stored record.
pub fn build_adapter(
    kind: BrokerKind,
    api_base_url: &str,
    permits: usize,
    deadline: Duration,
) -> Arc<dyn BrokerPort> {
    let env = |name: &str| std::env::var(name).unwrap_or_default();
    match kind {
        BrokerKind::Zerodha => Arc::new(zerodha::ZerodhaBroker::new(
            api_base_url,
            env("ZERODHA_API_KEY"),
            env("ZERODHA_API_SECRET"),
            permits,
            deadline,
        )),
        BrokerKind::Fyers => Arc::new(fyers::FyersBroker::new(
            api_base_url,
            env("FYERS_APP_ID"),
            env("FYERS_APP_SECRET"),
            permits,
            deadline,
        )),
        BrokerKind::Upstox => Arc::new(upstox::UpstoxBroker::new(
            api_base_url,
            env("UPSTOX_API_KEY"),
            env("UPSTOX_API_SECRET"),
            env("UPSTOX_REDIRECT_URI"),
            permits,
            deadline,
        )),
        BrokerKind::Dhan => Arc::new(dhan::DhanBroker::new(
            api_base_url,
            env("DHAN_CLIENT_ID"),
            permits,
            deadline,
        )),
        BrokerKind::Mock => mock::MockBroker::new(),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One long-lived adapter per user-broker, held in a keyed map.
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn BrokerPort>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, user_broker_id: &str, adapter: Arc<dyn BrokerPort>) {
        self.adapters
            .write()
            .insert(user_broker_id.to_string(), adapter);
    }

    pub fn get(&self, user_broker_id: &str) -> Option<Arc<dyn BrokerPort>> {
        self.adapters.read().get(user_broker_id).cloned()
    }

    pub fn user_broker_ids(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.adapters.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_table() {
        assert_eq!(map_broker_status("COMPLETE"), BrokerOrderState::Filled);
        assert_eq!(map_broker_status("FILLED"), BrokerOrderState::Filled);
        assert_eq!(
            map_broker_status("PUT ORDER REQ RECEIVED"),
            BrokerOrderState::Placed
        );
        assert_eq!(
            map_broker_status("VALIDATION PENDING"),
            BrokerOrderState::Placed
        );
        assert_eq!(map_broker_status("OPEN PENDING"), BrokerOrderState::Pending);
        assert_eq!(
            map_broker_status("TRIGGER PENDING"),
            BrokerOrderState::Pending
        );
        assert_eq!(map_broker_status("OPEN"), BrokerOrderState::Pending);
        assert_eq!(map_broker_status("REJECTED"), BrokerOrderState::Rejected);
        assert_eq!(map_broker_status("CANCELLED"), BrokerOrderState::Cancelled);
        // Unknown strings stay pending so the reconciler keeps polling.
        assert_eq!(
            map_broker_status("SOMETHING NEW"),
            BrokerOrderState::Pending
        );
    }

    #[test]
    fn product_translation_per_broker() {
        assert_eq!(translate_product(BrokerKind::Zerodha, ProductType::Mtf), "MTF");
        assert_eq!(translate_product(BrokerKind::Dhan, ProductType::Mtf), "MTF");
        assert_eq!(translate_product(BrokerKind::Fyers, ProductType::Mtf), "MARGIN");
        assert_eq!(translate_product(BrokerKind::Upstox, ProductType::Cnc), "D");
        assert_eq!(translate_product(BrokerKind::Upstox, ProductType::Mis), "I");
        assert_eq!(translate_product(BrokerKind::Dhan, ProductType::Mis), "INTRADAY");
        assert_eq!(translate_product(BrokerKind::Dhan, ProductType::Nrml), "MARGIN");
    }

    #[test]
    fn error_kinds_are_stable_labels() {
        assert_eq!(
            BrokerError::NotAuthenticated("no token".into()).kind(),
            "NOT_AUTHENTICATED"
        );
        assert_eq!(
            BrokerError::Timeout(Duration::from_secs(10)).kind(),
            "TIMEOUT"
        );
        let rejected = BrokerError::Rejected {
            code: "RMS:MARGIN_SHORTFALL".into(),
            message: "insufficient margin".into(),
        };
        assert_eq!(rejected.kind(), "BROKER_REJECTED");
        let (code, message) = rejected.rejection_payload();
        assert_eq!(code, "RMS:MARGIN_SHORTFALL");
        assert_eq!(message, "insufficient margin");
    }

    #[test]
    fn non_rejection_payload_uses_kind_as_code() {
        let err = BrokerError::Connection("socket closed".into());
        let (code, message) = err.rejection_payload();
        assert_eq!(code, "CONNECTION");
        assert!(message.contains("socket closed"));
    }
}
