// =============================================================================
// Zerodha (Kite Connect) adapter
// =============================================================================
//
// SECURITY: the API secret is used only for the session checksum and never
// logged or serialised. All authenticated requests carry
// `Authorization: token api_key:access_token` plus `X-Kite-Version: 3`.
// =============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

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

/// Kite session tokens die at 06:00 IST the next day; 8 hours is a safe
/// conservative lifetime for scheduling refreshes.
const TOKEN_LIFETIME_MS: i64 = 8 * 3600 * 1000;

pub struct ZerodhaBroker {
    core: RestCore,
    api_key: String,
    api_secret: String,
    ws_url: String,
    dropped_ticks: Arc<AtomicU64>,
}

impl ZerodhaBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        permits: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            core: RestCore::new(
                base_url,
                permits,
                RateLimits {
                    per_second: 10,
                    per_minute: 200,
                    per_day: 150_000,
                },
                deadline,
            ),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            ws_url: "wss://ws.kite.trade".into(),
            dropped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn auth_headers(&self) -> BrokerResult<Vec<(&'static str, String)>> {
        let token = self.core.token()?;
        Ok(vec![
            ("Authorization", format!("token {}:{}", self.api_key, token)),
            ("X-Kite-Version", "3".to_string()),
        ])
    }

    /// `data` envelope of a Kite response.
    fn data(body: serde_json::Value) -> BrokerResult<serde_json::Value> {
        if body.get("status").and_then(|s| s.as_str()) == Some("error") {
            return Err(BrokerError::Rejected {
                code: body
                    .get("error_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("GeneralException")
                    .to_string(),
                message: body
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown broker error")
                    .to_string(),
            });
        }
        Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }

    fn interval_label(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "minute",
            Timeframe::M5 => "5minute",
            Timeframe::M15 => "15minute",
            Timeframe::M25 => "25minute",
            Timeframe::M30 => "30minute",
            Timeframe::M60 => "60minute",
            Timeframe::M125 => "125minute",
            Timeframe::Daily => "day",
        }
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
                order.get("average_price").unwrap_or(&serde_json::Value::Null),
                "average_price",
            )?,
            tag: order.get("tag").and_then(|v| v.as_str()).map(|s| s.to_string()),
            symbol: order
                .get("tradingsymbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn parse_tick(text: &str) -> anyhow::Result<Option<Tick>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root.get("type").and_then(|v| v.as_str()) != Some("tick") {
            return Ok(None);
        }
        let symbol = root
            .get("tradingsymbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("tick missing tradingsymbol"))?
            .to_string();
        let last_price = root
            .get("last_price")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("tick missing last_price"))?;
        let ohlc = root.get("ohlc").cloned().unwrap_or(serde_json::Value::Null);
        let to_dec = |v: Option<f64>| v.and_then(|f| Decimal::try_from(f).ok());

        Ok(Some(Tick {
            symbol,
            last_price: Decimal::try_from(last_price)
                .map_err(|e| anyhow::anyhow!("bad last_price: {e}"))?
                .round_dp(2),
            open: to_dec(ohlc.get("open").and_then(|v| v.as_f64())),
            high: to_dec(ohlc.get("high").and_then(|v| v.as_f64())),
            low: to_dec(ohlc.get("low").and_then(|v| v.as_f64())),
            close: to_dec(ohlc.get("close").and_then(|v| v.as_f64())),
            volume: root.get("last_quantity").and_then(|v| v.as_i64()).unwrap_or(0),
            bid: to_dec(root.pointer("/depth/buy/0/price").and_then(|v| v.as_f64())),
            ask: to_dec(root.pointer("/depth/sell/0/price").and_then(|v| v.as_f64())),
            broker_ts: root
                .get("exchange_timestamp")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms),
            received_at: now_ms(),
        }))
    }
}

#[async_trait]
impl BrokerPort for ZerodhaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Zerodha
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> BrokerResult<SessionToken> {
        // checksum = SHA-256(api_key + request_token + api_secret)
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(credentials.auth_code.as_bytes());
        hasher.update(self.api_secret.as_bytes());
        let checksum = hex::encode(hasher.finalize());

        let body = serde_json::json!({
            "api_key": self.api_key,
            "request_token": credentials.auth_code,
            "checksum": checksum,
        });
        let response = self
            .core
            .request(
                Method::POST,
                "/session/token",
                &[("X-Kite-Version", "3".to_string())],
                &[],
                Some(&body),
            )
            .await?;
        let data = Self::data(response)?;
        let access_token = data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrokerError::NotAuthenticated("session response missing access_token".into())
            })?
            .to_string();

        self.core.set_token(&access_token);
        info!("zerodha session established");
        Ok(SessionToken {
            access_token,
            refresh_token: data
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
        let mut body = serde_json::json!({
            "tradingsymbol": request.symbol,
            "exchange": request.exchange,
            "transaction_type": request.transaction_type.as_str(),
            "order_type": request.order_type.as_str(),
            "product": translate_product(BrokerKind::Zerodha, request.product_type),
            "quantity": request.quantity,
            "validity": request.validity.as_str(),
            "tag": request.tag,
        });
        if let Some(price) = request.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(trigger) = request.trigger_price {
            body["trigger_price"] = serde_json::json!(trigger.to_string());
        }

        debug!(symbol = %request.symbol, tag = %request.tag, "placing zerodha order");
        let response = self
            .core
            .request(Method::POST, "/orders/regular", &headers, &[], Some(&body))
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
        let mut body = serde_json::Map::new();
        if let Some(qty) = change.quantity {
            body.insert("quantity".into(), serde_json::json!(qty));
        }
        if let Some(price) = change.price {
            body.insert("price".into(), serde_json::json!(price.to_string()));
        }
        if let Some(trigger) = change.trigger_price {
            body.insert("trigger_price".into(), serde_json::json!(trigger.to_string()));
        }
        if let Some(order_type) = change.order_type {
            body.insert("order_type".into(), serde_json::json!(order_type.as_str()));
        }

        let response = self
            .core
            .request(
                Method::PUT,
                &format!("/orders/regular/{order_id}"),
                &headers,
                &[],
                Some(&serde_json::Value::Object(body)),
            )
            .await?;
        let data = Self::data(response)?;
        Ok(PlacedOrder {
            order_id: data
                .get("order_id")
                .and_then(|v| v.as_str())
                .unwrap_or(order_id)
                .to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::DELETE,
                &format!("/orders/regular/{order_id}"),
                &headers,
                &[],
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
                &format!("/orders/{order_id}"),
                &headers,
                &[],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        // Kite returns the order's full state history; the last entry is
        // current.
        let latest = data
            .as_array()
            .and_then(|arr| arr.last())
            .ok_or_else(|| BrokerError::InvalidOrder(format!("no such order {order_id}")))?;
        Self::order_status_from_json(latest)
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/orders", &headers, &[], None)
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
            .request(Method::GET, "/portfolio/positions", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        let mut positions = Vec::new();
        for p in data.get("net").and_then(|v| v.as_array()).into_iter().flatten() {
            positions.push(BrokerPosition {
                symbol: p
                    .get("tradingsymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: p
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
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
            .request(Method::GET, "/portfolio/holdings", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        let mut holdings = Vec::new();
        for h in data.as_array().into_iter().flatten() {
            holdings.push(BrokerHolding {
                symbol: h
                    .get("tradingsymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: h
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
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
            .request(Method::GET, "/user/margins/equity", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        Ok(Funds {
            available: parse_decimal(
                data.pointer("/available/cash").unwrap_or(&serde_json::Value::Null),
                "available.cash",
            )
            .unwrap_or(Decimal::ZERO),
            utilised: parse_decimal(
                data.pointer("/utilised/debits").unwrap_or(&serde_json::Value::Null),
                "utilised.debits",
            )
            .unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        let headers = self.auth_headers()?;
        let instrument = format!("NSE:{symbol}");
        let response = self
            .core
            .request(
                Method::GET,
                "/quote/ltp",
                &headers,
                &[("i", instrument.clone())],
                None,
            )
            .await?;
        let data = Self::data(response)?;
        parse_decimal(
            data.pointer(&format!("/{instrument}/last_price"))
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
        let url = format!(
            "{}?api_key={}&access_token={}&symbols={}",
            self.ws_url,
            self.api_key,
            token,
            symbols.join(",").to_lowercase()
        );
        let stale = self.core.stale_flag();
        let dropped = self.dropped_ticks.clone();
        tokio::spawn(async move {
            if let Err(e) =
                stream::run_tick_stream("zerodha", url, listener, stale, dropped, Self::parse_tick)
                    .await
            {
                warn!(error = %e, "zerodha tick stream terminated");
            }
        });
        Ok(())
    }

    async fn unsubscribe_ticks(&self, _symbols: &[String]) -> BrokerResult<()> {
        // The stream task ends when the listener channel is dropped.
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
        let response = self
            .core
            .request(
                Method::GET,
                &format!(
                    "/instruments/historical/NSE:{symbol}/{}",
                    Self::interval_label(timeframe)
                ),
                &headers,
                &[("from", from.to_string()), ("to", to.to_string())],
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
                _ => {
                    warn!("skipping malformed historical candle entry");
                    continue;
                }
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
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "historical candles fetched");
        Ok(candles)
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/instruments/NSE", &headers, &[], None)
            .await?;
        let data = Self::data(response)?;
        let mut instruments = Vec::new();
        for row in data.as_array().into_iter().flatten() {
            instruments.push(InstrumentRecord {
                exchange: row
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or("NSE")
                    .to_string(),
                trading_symbol: row
                    .get("tradingsymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                broker_token: serde_json::json!({
                    "instrument_token": row.get("instrument_token").cloned(),
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

impl std::fmt::Debug for ZerodhaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZerodhaBroker")
            .field("api_key", &"<redacted>")
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
    fn tick_parsing_full_payload() {
        let json = r#"{
            "type": "tick",
            "tradingsymbol": "SBIN",
            "last_price": 502.5,
            "last_quantity": 20,
            "ohlc": { "open": 500.0, "high": 503.0, "low": 499.0, "close": 501.0 },
            "depth": { "buy": [{ "price": 502.45 }], "sell": [{ "price": 502.55 }] },
            "exchange_timestamp": 1700000000000
        }"#;
        let tick = ZerodhaBroker::parse_tick(json).unwrap().unwrap();
        assert_eq!(tick.symbol, "SBIN");
        assert_eq!(tick.last_price, dec!(502.50));
        assert_eq!(tick.volume, 20);
        assert_eq!(tick.bid, Some(dec!(502.45)));
        assert_eq!(tick.broker_ts, 1_700_000_000_000);
    }

    #[test]
    fn non_tick_messages_are_ignored() {
        let json = r#"{ "type": "order_update", "order_id": "X" }"#;
        assert!(ZerodhaBroker::parse_tick(json).unwrap().is_none());
    }

    #[test]
    fn error_envelope_maps_to_rejection() {
        let body = serde_json::json!({
            "status": "error",
            "error_type": "InputException",
            "message": "Invalid order params"
        });
        let err = ZerodhaBroker::data(body).unwrap_err();
        assert_eq!(err.kind(), "BROKER_REJECTED");
    }

    #[test]
    fn order_status_parsing() {
        let order = serde_json::json!({
            "order_id": "230801000001",
            "status": "COMPLETE",
            "filled_quantity": 20,
            "average_price": 502.5,
            "tag": "intent-1",
            "tradingsymbol": "SBIN"
        });
        let report = ZerodhaBroker::order_status_from_json(&order).unwrap();
        assert_eq!(report.status, crate::types::BrokerOrderState::Filled);
        assert_eq!(report.filled_qty, 20);
        assert_eq!(report.tag.as_deref(), Some("intent-1"));
    }

    #[test]
    fn interval_labels() {
        assert_eq!(ZerodhaBroker::interval_label(Timeframe::M1), "minute");
        assert_eq!(ZerodhaBroker::interval_label(Timeframe::M125), "125minute");
        assert_eq!(ZerodhaBroker::interval_label(Timeframe::Daily), "day");
    }
}
