// =============================================================================
// Upstox (API v2) adapter
// =============================================================================
//
// Standard OAuth bearer token. Upstox has no MTF product; MTF translates to
// the margin product code. Instrument keys are `NSE_EQ|<symbol>`.
// =============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
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
use crate::types::{now_ms, BrokerKind, Timeframe};

/// Upstox tokens expire at 03:30 IST; half a day is a safe bound.
const TOKEN_LIFETIME_MS: i64 = 12 * 3600 * 1000;

pub struct UpstoxBroker {
    core: RestCore,
    api_key: String,
    api_secret: String,
    redirect_uri: String,
    ws_url: String,
    dropped_ticks: Arc<AtomicU64>,
}

impl UpstoxBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        permits: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            core: RestCore::new(base_url, permits, RateLimits::default(), deadline),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            redirect_uri: redirect_uri.into(),
            ws_url: "wss://api.upstox.com/v2/feed/market-data-feed".into(),
            dropped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn auth_headers(&self) -> BrokerResult<Vec<(&'static str, String)>> {
        let token = self.core.token()?;
        Ok(vec![("Authorization", format!("Bearer {token}"))])
    }

    fn data(body: serde_json::Value) -> BrokerResult<serde_json::Value> {
        if body.get("status").and_then(|v| v.as_str()) == Some("error") {
            let first = body.pointer("/errors/0").cloned().unwrap_or_default();
            return Err(BrokerError::Rejected {
                code: first
                    .get("errorCode")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UPSTOX_ERROR")
                    .to_string(),
                message: first
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown broker error")
                    .to_string(),
            });
        }
        Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }

    fn instrument_key(symbol: &str) -> String {
        format!("NSE_EQ|{symbol}")
    }

    fn order_status_from_json(order: &serde_json::Value) -> BrokerResult<OrderStatusReport> {
        let raw_status = order
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(OrderStatusReport {
            order_id: order
                .get("order_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: map_broker_status(&raw_status),
            raw_status,
            status_message: order
                .get("status_message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            filled_qty: order
                .get("filled_quantity")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            avg_price: parse_decimal_opt(
                order
                    .get("average_price")
                    .unwrap_or(&serde_json::Value::Null),
                "average_price",
            )?,
            tag: order.get("tag").and_then(|v| v.as_str()).map(|s| s.to_string()),
            symbol: order
                .get("trading_symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn parse_tick(text: &str) -> anyhow::Result<Option<Tick>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let Some(symbol) = root.get("trading_symbol").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let Some(ltp) = root.get("ltp").and_then(|v| v.as_f64()) else {
            return Ok(None);
        };
        let to_dec = |v: Option<f64>| v.and_then(|f| Decimal::try_from(f).ok());
        Ok(Some(Tick {
            symbol: symbol.to_string(),
            last_price: Decimal::try_from(ltp)
                .map_err(|e| anyhow::anyhow!("bad ltp: {e}"))?
                .round_dp(2),
            open: to_dec(root.pointer("/ohlc/open").and_then(|v| v.as_f64())),
            high: to_dec(root.pointer("/ohlc/high").and_then(|v| v.as_f64())),
            low: to_dec(root.pointer("/ohlc/low").and_then(|v| v.as_f64())),
            close: to_dec(root.pointer("/ohlc/close").and_then(|v| v.as_f64())),
            volume: root.get("ltq").and_then(|v| v.as_i64()).unwrap_or(0),
            bid: to_dec(root.get("bid_price").and_then(|v| v.as_f64())),
            ask: to_dec(root.get("ask_price").and_then(|v| v.as_f64())),
            broker_ts: root.get("ltt").and_then(|v| v.as_i64()).unwrap_or_else(now_ms),
            received_at: now_ms(),
        }))
    }
}

#[async_trait]
impl BrokerPort for UpstoxBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Upstox
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> BrokerResult<SessionToken> {
        let body = serde_json::json!({
            "code": credentials.auth_code,
            "client_id": self.api_key,
            "client_secret": self.api_secret,
            "redirect_uri": self.redirect_uri,
            "grant_type": "authorization_code",
        });
        let response = self
            .core
            .request(
                Method::POST,
                "/v2/login/authorization/token",
                &[],
                &[],
                Some(&body),
            )
            .await?;
        let access_token = response
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrokerError::NotAuthenticated("token response missing access_token".into())
            })?
            .to_string();
        self.core.set_token(&access_token);
        debug!("upstox session established");
        Ok(SessionToken {
            access_token,
            refresh_token: None,
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
            "instrument_token": Self::instrument_key(&request.symbol),
            "transaction_type": request.transaction_type.as_str(),
            "order_type": request.order_type.as_str(),
            "product": translate_product(BrokerKind::Upstox, request.product_type),
            "quantity": request.quantity,
            "price": request.price.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
            "trigger_price": request.trigger_price.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
            "validity": request.validity.as_str(),
            "tag": request.tag,
            "is_amo": false,
        });
        let response = self
            .core
            .request(Method::POST, "/v2/order/place", &headers, &[], Some(&body))
            .await?;
        let data = Self::data(response)?;
        let order_id = data
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::InvalidOrder("order response missing order_id".into()))?
            .to_string();
        Ok(PlacedOrder { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderChange,
    ) -> BrokerResult<PlacedOrder> {
        let headers = self.auth_headers()?;
        let mut body = serde_json::json!({ "order_id": order_id });
        if let Some(qty) = change.quantity {
            body["quantity"] = serde_json::json!(qty);
        }
        if let Some(price) = change.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(trigger) = change.trigger_price {
            body["trigger_price"] = serde_json::json!(trigger.to_string());
        }
        if let Some(order_type) = change.order_type {
            body["order_type"] = serde_json::json!(order_type.as_str());
        }
        let response = self
            .core
            .request(Method::PUT, "/v2/order/modify", &headers, &[], Some(&body))
            .await?;
        Self::data(response)?;
        Ok(PlacedOrder {
            order_id: order_id.to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::DELETE,
                "/v2/order/cancel",
                &headers,
                &[("order_id", order_id.to_string())],
                None,
            )
            .await?;
        Self::data(response)?;
        Ok(())
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderStatusReport> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::GET,
                "/v2/order/details",
                &headers,
                &[("order_id", order_id.to_string())],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        Self::order_status_from_json(&data)
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/v2/order/retrieve-all", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        let mut open = Vec::new();
        for order in data.as_array().into_iter().flatten() {
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
            .request(
                Method::GET,
                "/v2/portfolio/short-term-positions",
                &headers,
                &[],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        let mut positions = Vec::new();
        for p in data.as_array().into_iter().flatten() {
            positions.push(BrokerPosition {
                symbol: p
                    .get("trading_symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: p
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or("NSE")
                    .to_string(),
                quantity: p.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    p.get("average_price").unwrap_or(&serde_json::Value::Null),
                    "average_price",
                )
                .unwrap_or(Decimal::ZERO),
                product_type: p
                    .get("product")
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
            .request(
                Method::GET,
                "/v2/portfolio/long-term-holdings",
                &headers,
                &[],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        let mut holdings = Vec::new();
        for h in data.as_array().into_iter().flatten() {
            holdings.push(BrokerHolding {
                symbol: h
                    .get("trading_symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: h
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or("NSE")
                    .to_string(),
                quantity: h.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    h.get("average_price").unwrap_or(&serde_json::Value::Null),
                    "average_price",
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
            .request(
                Method::GET,
                "/v2/user/get-funds-and-margin",
                &headers,
                &[("segment", "SEC".to_string())],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        Ok(Funds {
            available: parse_decimal(
                data.pointer("/equity/available_margin")
                    .unwrap_or(&serde_json::Value::Null),
                "available_margin",
            )
            .unwrap_or(Decimal::ZERO),
            utilised: parse_decimal(
                data.pointer("/equity/used_margin")
                    .unwrap_or(&serde_json::Value::Null),
                "used_margin",
            )
            .unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        let headers = self.auth_headers()?;
        let key = Self::instrument_key(symbol);
        let response = self
            .core
            .request(
                Method::GET,
                "/v2/market-quote/ltp",
                &headers,
                &[("instrument_key", key.clone())],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        // Response keys replace '|' with ':'.
        let json_key = key.replace('|', ":");
        parse_decimal(
            data.pointer(&format!("/{json_key}/last_price"))
                .unwrap_or(&serde_json::Value::Null),
            "last_price",
        )
    }

    async fn subscribe_ticks(
        &self,
        symbols: &[String],
        listener: TickSender,
    ) -> BrokerResult<()> {
        let token = self.core.token()?;
        let keys: Vec<String> = symbols.iter().map(|s| Self::instrument_key(s)).collect();
        let url = format!(
            "{}?token={}&instrument_keys={}",
            self.ws_url,
            token,
            keys.join(",")
        );
        let stale = self.core.stale_flag();
        let dropped = self.dropped_ticks.clone();
        tokio::spawn(async move {
            if let Err(e) =
                stream::run_tick_stream("upstox", url, listener, stale, dropped, Self::parse_tick)
                    .await
            {
                warn!(error = %e, "upstox tick stream terminated");
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
        let interval = match timeframe {
            Timeframe::Daily => "day".to_string(),
            other => format!("{}minute", other.duration_secs() / 60),
        };
        let response = self
            .core
            .request(
                Method::GET,
                &format!(
                    "/v2/historical-candle/{}/{}/{}/{}",
                    Self::instrument_key(symbol),
                    interval,
                    to,
                    from
                ),
                &headers,
                &[],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        let mut candles = Vec::new();
        for entry in data
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
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_decimal(&arr[1], "open")?,
                high: parse_decimal(&arr[2], "high")?,
                low: parse_decimal(&arr[3], "low")?,
                close: parse_decimal(&arr[4], "close")?,
                volume: arr[5].as_i64().unwrap_or(0),
            });
        }
        // Upstox returns newest-first; storage expects oldest-first.
        candles.reverse();
        Ok(candles)
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/v2/instruments/NSE", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        let mut instruments = Vec::new();
        for row in data.as_array().into_iter().flatten() {
            instruments.push(InstrumentRecord {
                exchange: "NSE".into(),
                trading_symbol: row
                    .get("trading_symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                broker_token: serde_json::json!({
                    "instrument_key": row.get("instrument_key").cloned(),
                }),
                lot_size: row.get("lot_size").and_then(|v| v.as_i64()).unwrap_or(1),
                tick_size: parse_decimal_opt(
                    row.get("tick_size").unwrap_or(&serde_json::Value::Null),
                    "tick_size",
                )?
                .unwrap_or_else(|| Decimal::new(5, 2)),
            });
        }
        Ok(instruments)
    }
}

impl std::fmt::Debug for UpstoxBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstoxBroker")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
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
    fn instrument_keys() {
        assert_eq!(UpstoxBroker::instrument_key("SBIN"), "NSE_EQ|SBIN");
    }

    #[test]
    fn error_envelope_maps_to_rejection() {
        let body = serde_json::json!({
            "status": "error",
            "errors": [{ "errorCode": "UDAPI1021", "message": "Invalid instrument" }]
        });
        let err = UpstoxBroker::data(body).unwrap_err();
        match err {
            BrokerError::Rejected { code, .. } => assert_eq!(code, "UDAPI1021"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn order_status_parsing() {
        let order = serde_json::json!({
            "order_id": "240801000001",
            "status": "open pending",
            "filled_quantity": 0,
            "trading_symbol": "SBIN",
            "tag": "intent-1"
        });
        let report = UpstoxBroker::order_status_from_json(&order).unwrap();
        assert_eq!(report.status, crate::types::BrokerOrderState::Pending);
    }

    #[test]
    fn tick_parsing() {
        let json = r#"{
            "trading_symbol": "SBIN",
            "ltp": 502.5,
            "ltq": 25,
            "ltt": 1700000000000,
            "ohlc": { "open": 500.0, "high": 503.0, "low": 499.0, "close": 501.0 }
        }"#;
        let tick = UpstoxBroker::parse_tick(json).unwrap().unwrap();
        assert_eq!(tick.last_price, dec!(502.50));
        assert_eq!(tick.open, Some(dec!(500)));
        assert_eq!(tick.volume, 25);
    }
}
