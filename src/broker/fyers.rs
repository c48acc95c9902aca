// =============================================================================
// Fyers (API v3) adapter
// =============================================================================
//
// Authenticated with `Authorization: app_id:access_token`. The auth-code
// exchange signs the app id with HMAC-SHA256 over the app secret
// (`appIdHash`). Fyers has no MTF product; MTF orders translate to MARGIN.
// =============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, warn};

use super::http::{parse_decimal, parse_decimal_opt, RestCore};
use super::rate_limit::RateLimits;
use super::{
    map_broker_status, stream, translate_product, BrokerCredentials, BrokerError, BrokerHolding,
    BrokerPort, BrokerPosition, BrokerResult, Funds, InstrumentRecord, OrderChange, OrderRequest,
    OrderStatusReport, PlacedOrder, SessionToken, TickSender,
};
use crate::market::Tick;
use crate::models::Candle;
use crate::types::{now_ms, BrokerKind, Direction, OrderType, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// Fyers tokens last the trading day; refresh via the refresh token.
const TOKEN_LIFETIME_MS: i64 = 12 * 3600 * 1000;

pub struct FyersBroker {
    core: RestCore,
    app_id: String,
    app_secret: String,
    ws_url: String,
    dropped_ticks: Arc<AtomicU64>,
}

impl FyersBroker {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        permits: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            core: RestCore::new(base_url, permits, RateLimits::default(), deadline),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            ws_url: "wss://socket.fyers.in/data".into(),
            dropped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn app_id_hash(&self) -> String {
        let mut mac = HmacSha256::new_from_slice(self.app_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(self.app_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self) -> BrokerResult<Vec<(&'static str, String)>> {
        let token = self.core.token()?;
        Ok(vec![(
            "Authorization",
            format!("{}:{}", self.app_id, token),
        )])
    }

    fn check(body: serde_json::Value) -> BrokerResult<serde_json::Value> {
        if body.get("s").and_then(|v| v.as_str()) == Some("error") {
            return Err(BrokerError::Rejected {
                code: body
                    .get("code")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "FYERS_ERROR".into()),
                message: body
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown broker error")
                    .to_string(),
            });
        }
        Ok(body)
    }

    /// Fyers order side/type codes.
    fn side_code(direction: Direction) -> i64 {
        match direction {
            Direction::Buy => 1,
            Direction::Sell => -1,
        }
    }

    fn type_code(order_type: OrderType) -> i64 {
        match order_type {
            OrderType::Limit => 1,
            OrderType::Market => 2,
            OrderType::StopLoss => 3,
        }
    }

    fn order_status_from_json(order: &serde_json::Value) -> BrokerResult<OrderStatusReport> {
        // Fyers reports numeric statuses: 2 filled, 5 rejected, 1 cancelled,
        // 6 pending at exchange.
        let raw_status = match order.get("status").and_then(|v| v.as_i64()) {
            Some(2) => "FILLED",
            Some(5) => "REJECTED",
            Some(1) => "CANCELLED",
            Some(6) => "OPEN PENDING",
            _ => "OPEN",
        }
        .to_string();
        Ok(OrderStatusReport {
            order_id: order
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: map_broker_status(&raw_status),
            raw_status,
            status_message: order
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            filled_qty: order.get("filledQty").and_then(|v| v.as_i64()).unwrap_or(0),
            avg_price: parse_decimal_opt(
                order.get("tradedPrice").unwrap_or(&serde_json::Value::Null),
                "tradedPrice",
            )?,
            tag: order
                .get("orderTag")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            symbol: order
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim_start_matches("NSE:")
                .trim_end_matches("-EQ")
                .to_string(),
        })
    }

    fn parse_tick(text: &str) -> anyhow::Result<Option<Tick>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let Some(symbol) = root.get("symbol").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let Some(ltp) = root.get("ltp").and_then(|v| v.as_f64()) else {
            return Ok(None);
        };
        let to_dec = |v: Option<f64>| v.and_then(|f| Decimal::try_from(f).ok());
        Ok(Some(Tick {
            symbol: symbol
                .trim_start_matches("NSE:")
                .trim_end_matches("-EQ")
                .to_string(),
            last_price: Decimal::try_from(ltp)
                .map_err(|e| anyhow::anyhow!("bad ltp: {e}"))?
                .round_dp(2),
            open: to_dec(root.get("open_price").and_then(|v| v.as_f64())),
            high: to_dec(root.get("high_price").and_then(|v| v.as_f64())),
            low: to_dec(root.get("low_price").and_then(|v| v.as_f64())),
            close: to_dec(root.get("prev_close_price").and_then(|v| v.as_f64())),
            volume: root.get("last_traded_qty").and_then(|v| v.as_i64()).unwrap_or(0),
            bid: to_dec(root.get("bid_price").and_then(|v| v.as_f64())),
            ask: to_dec(root.get("ask_price").and_then(|v| v.as_f64())),
            broker_ts: root
                .get("last_traded_time")
                .and_then(|v| v.as_i64())
                .map(|s| s * 1000)
                .unwrap_or_else(now_ms),
            received_at: now_ms(),
        }))
    }

    fn wire_symbol(symbol: &str) -> String {
        format!("NSE:{symbol}-EQ")
    }
}

#[async_trait]
impl BrokerPort for FyersBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Fyers
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> BrokerResult<SessionToken> {
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "appIdHash": self.app_id_hash(),
            "code": credentials.auth_code,
        });
        let response = self
            .core
            .request(Method::POST, "/api/v3/validate-authcode", &[], &[], Some(&body))
            .await?;
        let body = Self::check(response)?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrokerError::NotAuthenticated("auth response missing access_token".into())
            })?
            .to_string();
        self.core.set_token(&access_token);
        debug!("fyers session established");
        Ok(SessionToken {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            expires_at: now_ms() + TOKEN_LIFETIME_MS,
        })
    }

    fn set_access_token(&self, token: &str) {
        self.core.set_token(token);
    }

    fn can_place_orders(&self) -> bool {
        self.core.can_place_orders()
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<PlacedOrder> {
        let headers = self.auth_headers()?;
        let body = serde_json::json!({
            "symbol": Self::wire_symbol(&request.symbol),
            "qty": request.quantity,
            "type": Self::type_code(request.order_type),
            "side": Self::side_code(request.transaction_type),
            "productType": translate_product(BrokerKind::Fyers, request.product_type),
            "limitPrice": request.price.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
            "stopPrice": request.trigger_price.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
            "validity": request.validity.as_str(),
            "orderTag": request.tag,
        });
        let response = self
            .core
            .request(Method::POST, "/api/v3/orders/sync", &headers, &[], Some(&body))
            .await?;
        let body = Self::check(response)?;
        let order_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::InvalidOrder("order response missing id".into()))?
            .to_string();
        Ok(PlacedOrder { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderChange,
    ) -> BrokerResult<PlacedOrder> {
        let headers = self.auth_headers()?;
        let mut body = serde_json::json!({ "id": order_id });
        if let Some(qty) = change.quantity {
            body["qty"] = serde_json::json!(qty);
        }
        if let Some(price) = change.price {
            body["limitPrice"] = serde_json::json!(price.to_string());
        }
        if let Some(trigger) = change.trigger_price {
            body["stopPrice"] = serde_json::json!(trigger.to_string());
        }
        if let Some(order_type) = change.order_type {
            body["type"] = serde_json::json!(Self::type_code(order_type));
        }
        let response = self
            .core
            .request(Method::PATCH, "/api/v3/orders/sync", &headers, &[], Some(&body))
            .await?;
        Self::check(response)?;
        Ok(PlacedOrder {
            order_id: order_id.to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let headers = self.auth_headers()?;
        let body = serde_json::json!({ "id": order_id });
        let response = self
            .core
            .request(Method::DELETE, "/api/v3/orders/sync", &headers, &[], Some(&body))
            .await?;
        Self::check(response)?;
        Ok(())
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderStatusReport> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::GET,
                "/api/v3/orders",
                &headers,
                &[("id", order_id.to_string())],
                None,
            )
            .await?;
        let body = Self::check(response)?;
        let order = body
            .get("orderBook")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| BrokerError::InvalidOrder(format!("no such order {order_id}")))?
            .clone();
        Self::order_status_from_json(&order)
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/api/v3/orders", &headers, &[], None)
            .await?;
        let body = Self::check(response)?;
        let mut open = Vec::new();
        for order in body
            .get("orderBook")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let report = Self::order_status_from_json(order)?;
            if matches!(
                report.status,
                crate::types::BrokerOrderState::Pending | crate::types::BrokerOrderState::Placed
            ) {
                open.push(report);
            }
        }
        Ok(open)
    }

    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/api/v3/positions", &headers, &[], None)
            .await?;
        let body = Self::check(response)?;
        let mut positions = Vec::new();
        for p in body
            .get("netPositions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            positions.push(BrokerPosition {
                symbol: p
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim_start_matches("NSE:")
                    .trim_end_matches("-EQ")
                    .to_string(),
                exchange: "NSE".into(),
                quantity: p.get("netQty").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    p.get("netAvg").unwrap_or(&serde_json::Value::Null),
                    "netAvg",
                )
                .unwrap_or(Decimal::ZERO),
                product_type: p
                    .get("productType")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(positions)
    }

    async fn list_holdings(&self) -> BrokerResult<Vec<BrokerHolding>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/api/v3/holdings", &headers, &[], None)
            .await?;
        let body = Self::check(response)?;
        let mut holdings = Vec::new();
        for h in body
            .get("holdings")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            holdings.push(BrokerHolding {
                symbol: h
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim_start_matches("NSE:")
                    .trim_end_matches("-EQ")
                    .to_string(),
                exchange: "NSE".into(),
                quantity: h.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    h.get("costPrice").unwrap_or(&serde_json::Value::Null),
                    "costPrice",
                )
                .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(holdings)
    }

    async fn get_funds(&self) -> BrokerResult<Funds> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/api/v3/funds", &headers, &[], None)
            .await?;
        let body = Self::check(response)?;
        // fund_limit[0] is the available-balance row.
        Ok(Funds {
            available: parse_decimal(
                body.pointer("/fund_limit/0/equityAmount")
                    .unwrap_or(&serde_json::Value::Null),
                "equityAmount",
            )
            .unwrap_or(Decimal::ZERO),
            utilised: parse_decimal(
                body.pointer("/fund_limit/1/equityAmount")
                    .unwrap_or(&serde_json::Value::Null),
                "utilisedAmount",
            )
            .unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::GET,
                "/data/quotes",
                &headers,
                &[("symbols", Self::wire_symbol(symbol))],
                None,
            )
            .await?;
        let body = Self::check(response)?;
        parse_decimal(
            body.pointer("/d/0/v/lp").unwrap_or(&serde_json::Value::Null),
            "lp",
        )
    }

    async fn subscribe_ticks(
        &self,
        symbols: &[String],
        listener: TickSender,
    ) -> BrokerResult<()> {
        let token = self.core.token()?;
        let wire: Vec<String> = symbols.iter().map(|s| Self::wire_symbol(s)).collect();
        let url = format!(
            "{}?access_token={}:{}&symbols={}",
            self.ws_url,
            self.app_id,
            token,
            wire.join(",")
        );
        let stale = self.core.stale_flag();
        let dropped = self.dropped_ticks.clone();
        tokio::spawn(async move {
            if let Err(e) =
                stream::run_tick_stream("fyers", url, listener, stale, dropped, Self::parse_tick)
                    .await
            {
                warn!(error = %e, "fyers tick stream terminated");
            }
        });
        Ok(())
    }

    async fn unsubscribe_ticks(&self, _symbols: &[String]) -> BrokerResult<()> {
        self.core.set_feed_stale(true);
        Ok(())
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> BrokerResult<Vec<Candle>> {
        let headers = self.auth_headers()?;
        let resolution = match timeframe {
            Timeframe::Daily => "D".to_string(),
            other => (other.duration_secs() / 60).to_string(),
        };
        let response = self
            .core
            .request(
                Method::GET,
                "/data/history",
                &headers,
                &[
                    ("symbol", Self::wire_symbol(symbol)),
                    ("resolution", resolution),
                    ("date_format", "0".into()),
                    ("range_from", (from / 1000).to_string()),
                    ("range_to", (to / 1000).to_string()),
                ],
                None,
            )
            .await?;
        let body = Self::check(response)?;
        let mut candles = Vec::new();
        for entry in body
            .get("candles")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let arr = match entry.as_array() {
                Some(arr) if arr.len() >= 6 => arr,
                _ => continue,
            };
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                open_time: arr[0].as_i64().unwrap_or(0) * 1000,
                open: parse_decimal(&arr[1], "open")?,
                high: parse_decimal(&arr[2], "high")?,
                low: parse_decimal(&arr[3], "low")?,
                close: parse_decimal(&arr[4], "close")?,
                volume: arr[5].as_i64().unwrap_or(0),
            });
        }
        Ok(candles)
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/data/symbol-master/NSE_CM", &headers, &[], None)
            .await?;
        let body = Self::check(response)?;
        let mut instruments = Vec::new();
        for row in body.as_array().into_iter().flatten() {
            instruments.push(InstrumentRecord {
                exchange: "NSE".into(),
                trading_symbol: row
                    .get("underSym")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .get("symbolDesc")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                broker_token: serde_json::json!({
                    "fyToken": row.get("fyToken").cloned(),
                }),
                lot_size: row.get("minLotSize").and_then(|v| v.as_i64()).unwrap_or(1),
                tick_size: parse_decimal_opt(
                    row.get("tickSize").unwrap_or(&serde_json::Value::Null),
                    "tickSize",
                )?
                .unwrap_or_else(|| Decimal::new(5, 2)),
            });
        }
        Ok(instruments)
    }
}

impl std::fmt::Debug for FyersBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FyersBroker")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("core", &self.core)
            .finish()
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
    fn numeric_status_codes_map() {
        let filled = serde_json::json!({ "id": "1", "status": 2, "symbol": "NSE:SBIN-EQ" });
        assert_eq!(
            FyersBroker::order_status_from_json(&filled).unwrap().status,
            crate::types::BrokerOrderState::Filled
        );
        let rejected = serde_json::json!({ "id": "1", "status": 5, "symbol": "NSE:SBIN-EQ" });
        assert_eq!(
            FyersBroker::order_status_from_json(&rejected).unwrap().status,
            crate::types::BrokerOrderState::Rejected
        );
    }

    #[test]
    fn wire_symbol_roundtrip() {
        assert_eq!(FyersBroker::wire_symbol("SBIN"), "NSE:SBIN-EQ");
        let order = serde_json::json!({ "id": "1", "status": 6, "symbol": "NSE:SBIN-EQ" });
        let report = FyersBroker::order_status_from_json(&order).unwrap();
        assert_eq!(report.symbol, "SBIN");
        assert_eq!(report.status, crate::types::BrokerOrderState::Pending);
    }

    #[test]
    fn tick_parsing_converts_seconds_to_millis() {
        let json = r#"{
            "symbol": "NSE:SBIN-EQ",
            "ltp": 502.5,
            "last_traded_qty": 10,
            "last_traded_time": 1700000000
        }"#;
        let tick = FyersBroker::parse_tick(json).unwrap().unwrap();
        assert_eq!(tick.symbol, "SBIN");
        assert_eq!(tick.last_price, dec!(502.50));
        assert_eq!(tick.broker_ts, 1_700_000_000_000);
    }

    #[test]
    fn side_and_type_codes() {
        assert_eq!(FyersBroker::side_code(Direction::Buy), 1);
        assert_eq!(FyersBroker::side_code(Direction::Sell), -1);
        assert_eq!(FyersBroker::type_code(OrderType::Limit), 1);
        assert_eq!(FyersBroker::type_code(OrderType::Market), 2);
    }
}
