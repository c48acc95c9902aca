// =============================================================================
// Dhan (DhanHQ v2) adapter
// =============================================================================
//
// Authenticated via the long-lived `access-token` header plus the client id.
// Dhan supports MTF as a first-class product, so no product downgrade happens
// here. `correlationId` carries the intent tag.
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

/// Dhan access tokens are issued for ~24 h.
const TOKEN_LIFETIME_MS: i64 = 24 * 3600 * 1000;

pub struct DhanBroker {
    core: RestCore,
    client_id: String,
    ws_url: String,
    dropped_ticks: Arc<AtomicU64>,
}

impl DhanBroker {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        permits: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            core: RestCore::new(
                base_url,
                permits,
                RateLimits {
                    per_second: 20,
                    per_minute: 250,
                    per_day: 100_000,
                },
                deadline,
            ),
            client_id: client_id.into(),
            ws_url: "wss://api-feed.dhan.co".into(),
            dropped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn auth_headers(&self) -> BrokerResult<Vec<(&'static str, String)>> {
        let token = self.core.token()?;
        Ok(vec![
            ("access-token", token),
            ("client-id", self.client_id.clone()),
        ])
    }

    fn check_rejection(body: &serde_json::Value) -> BrokerResult<()> {
        if let Some(code) = body.get("errorCode").and_then(|v| v.as_str()) {
            return Err(BrokerError::Rejected {
                code: code.to_string(),
                message: body
                    .get("errorMessage")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown broker error")
                    .to_string(),
            });
        }
        Ok(())
    }

    fn order_status_from_json(order: &serde_json::Value) -> BrokerResult<OrderStatusReport> {
        let raw_status = order
            .get("orderStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(OrderStatusReport {
            order_id: order
                .get("orderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: map_broker_status(&raw_status),
            raw_status,
            status_message: order
                .get("omsErrorDescription")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            filled_qty: order
                .get("filledQty")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            avg_price: parse_decimal_opt(
                order
                    .get("averageTradedPrice")
                    .unwrap_or(&serde_json::Value::Null),
                "averageTradedPrice",
            )?,
            tag: order
                .get("correlationId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            symbol: order
                .get("tradingSymbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn parse_tick(text: &str) -> anyhow::Result<Option<Tick>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root.get("type").and_then(|v| v.as_str()) != Some("Ticker") {
            return Ok(None);
        }
        let to_dec = |v: Option<f64>| v.and_then(|f| Decimal::try_from(f).ok());
        let symbol = root
            .get("tradingSymbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("ticker missing tradingSymbol"))?
            .to_string();
        let ltp = root
            .get("lastTradedPrice")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("ticker missing lastTradedPrice"))?;

        Ok(Some(Tick {
            symbol,
            last_price: Decimal::try_from(ltp)
                .map_err(|e| anyhow::anyhow!("bad lastTradedPrice: {e}"))?
                .round_dp(2),
            open: to_dec(root.get("open").and_then(|v| v.as_f64())),
            high: to_dec(root.get("high").and_then(|v| v.as_f64())),
            low: to_dec(root.get("low").and_then(|v| v.as_f64())),
            close: to_dec(root.get("close").and_then(|v| v.as_f64())),
            volume: root.get("lastTradedQty").and_then(|v| v.as_i64()).unwrap_or(0),
            bid: to_dec(root.get("bestBidPrice").and_then(|v| v.as_f64())),
            ask: to_dec(root.get("bestAskPrice").and_then(|v| v.as_f64())),
            broker_ts: root
                .get("lastTradeTime")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms),
            received_at: now_ms(),
        }))
    }
}

#[async_trait]
impl BrokerPort for DhanBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Dhan
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> BrokerResult<SessionToken> {
        // Dhan issues the access token out-of-band; connect validates it
        // against the profile endpoint and caches it.
        self.core.set_token(&credentials.auth_code);
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/v2/profile", &headers, &[], None)
            .await?;
        Self::check_rejection(&response)?;
        debug!("dhan token validated against profile");
        Ok(SessionToken {
            access_token: credentials.auth_code.clone(),
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
        let mut body = serde_json::json!({
            "dhanClientId": self.client_id,
            "correlationId": request.tag,
            "transactionType": request.transaction_type.as_str(),
            "exchangeSegment": format!("{}_EQ", request.exchange),
            "productType": translate_product(BrokerKind::Dhan, request.product_type),
            "orderType": request.order_type.as_str(),
            "validity": request.validity.as_str(),
            "tradingSymbol": request.symbol,
            "quantity": request.quantity,
        });
        if let Some(price) = request.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(trigger) = request.trigger_price {
            body["triggerPrice"] = serde_json::json!(trigger.to_string());
        }

        debug!(symbol = %request.symbol, tag = %request.tag, "placing dhan order");
        let response = self
            .core
            .request(Method::POST, "/v2/orders", &headers, &[], Some(&body))
            .await?;
        Self::check_rejection(&response)?;
        let order_id = response
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::InvalidOrder("order response missing orderId".into()))?
            .to_string();
        Ok(PlacedOrder { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderChange,
    ) -> BrokerResult<PlacedOrder> {
        let headers = self.auth_headers()?;
        let mut body = serde_json::json!({
            "dhanClientId": self.client_id,
            "orderId": order_id,
        });
        if let Some(qty) = change.quantity {
            body["quantity"] = serde_json::json!(qty);
        }
        if let Some(price) = change.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(trigger) = change.trigger_price {
            body["triggerPrice"] = serde_json::json!(trigger.to_string());
        }
        if let Some(order_type) = change.order_type {
            body["orderType"] = serde_json::json!(order_type.as_str());
        }

        let response = self
            .core
            .request(
                Method::PUT,
                &format!("/v2/orders/{order_id}"),
                &headers,
                &[],
                Some(&body),
            )
            .await?;
        Self::check_rejection(&response)?;
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
                &format!("/v2/orders/{order_id}"),
                &headers,
                &[],
                None,
            )
            .await?;
        Self::check_rejection(&response)
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderStatusReport> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(
                Method::GET,
                &format!("/v2/orders/{order_id}"),
                &headers,
                &[],
                None,
            )
            .await?;
        Self::check_rejection(&response)?;
        // Response may be the object itself or a one-element array.
        let order = response
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .unwrap_or(response);
        Self::order_status_from_json(&order)
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<OrderStatusReport>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/v2/orders", &headers, &[], None)
            .await?;
        let mut open = Vec::new();
        for order in response.as_array().into_iter().flatten() {
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
            .request(Method::GET, "/v2/positions", &headers, &[], None)
            .await?;
        let mut positions = Vec::new();
        for p in response.as_array().into_iter().flatten() {
            positions.push(BrokerPosition {
                symbol: p
                    .get("tradingSymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: "NSE".to_string(),
                quantity: p.get("netQty").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    p.get("costPrice").unwrap_or(&serde_json::Value::Null),
                    "costPrice",
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
            .request(Method::GET, "/v2/holdings", &headers, &[], None)
            .await?;
        let mut holdings = Vec::new();
        for h in response.as_array().into_iter().flatten() {
            holdings.push(BrokerHolding {
                symbol: h
                    .get("tradingSymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                exchange: h
                    .get("exchange")
                    .and_then(|v| v.as_str())
                    .unwrap_or("NSE")
                    .to_string(),
                quantity: h.get("totalQty").and_then(|v| v.as_i64()).unwrap_or(0),
                avg_price: parse_decimal(
                    h.get("avgCostPrice").unwrap_or(&serde_json::Value::Null),
                    "avgCostPrice",
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
            .request(Method::GET, "/v2/fundlimit", &headers, &[], None)
            .await?;
        Ok(Funds {
            available: parse_decimal(
                response
                    .get("availabelBalance")
                    .or_else(|| response.get("availableBalance"))
                    .unwrap_or(&serde_json::Value::Null),
                "availableBalance",
            )
            .unwrap_or(Decimal::ZERO),
            utilised: parse_decimal(
                response
                    .get("utilizedAmount")
                    .unwrap_or(&serde_json::Value::Null),
                "utilizedAmount",
            )
            .unwrap_or(Decimal::ZERO),
        })
    }

    async fn get_ltp(&self, symbol: &str) -> BrokerResult<Decimal> {
        let headers = self.auth_headers()?;
        let body = serde_json::json!({ "NSE_EQ": [symbol] });
        let response = self
            .core
            .request(Method::POST, "/v2/marketfeed/ltp", &headers, &[], Some(&body))
            .await?;
        parse_decimal(
            response
                .pointer(&format!("/data/NSE_EQ/{symbol}/last_price"))
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
            "{}?version=2&token={}&clientId={}&symbols={}",
            self.ws_url,
            token,
            self.client_id,
            symbols.join(",")
        );
        let stale = self.core.stale_flag();
        let dropped = self.dropped_ticks.clone();
        tokio::spawn(async move {
            if let Err(e) =
                stream::run_tick_stream("dhan", url, listener, stale, dropped, Self::parse_tick)
                    .await
            {
                warn!(error = %e, "dhan tick stream terminated");
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
        let body = serde_json::json!({
            "tradingSymbol": symbol,
            "exchangeSegment": "NSE_EQ",
            "interval": timeframe.as_str(),
            "fromDate": from,
            "toDate": to,
        });
        let path = if timeframe == Timeframe::Daily {
            "/v2/charts/historical"
        } else {
            "/v2/charts/intraday"
        };
        let response = self
            .core
            .request(Method::POST, path, &headers, &[], Some(&body))
            .await?;
        Self::check_rejection(&response)?;

        // Parallel arrays: timestamp/open/high/low/close/volume.
        let timestamps = response.get("timestamp").and_then(|v| v.as_array());
        let opens = response.get("open").and_then(|v| v.as_array());
        let highs = response.get("high").and_then(|v| v.as_array());
        let lows = response.get("low").and_then(|v| v.as_array());
        let closes = response.get("close").and_then(|v| v.as_array());
        let volumes = response.get("volume").and_then(|v| v.as_array());

        let (timestamps, opens, highs, lows, closes, volumes) =
            match (timestamps, opens, highs, lows, closes, volumes) {
                (Some(t), Some(o), Some(h), Some(l), Some(c), Some(v)) => (t, o, h, l, c, v),
                _ => return Ok(Vec::new()),
            };

        let mut candles = Vec::with_capacity(timestamps.len());
        for i in 0..timestamps.len() {
            let get = |arr: &[serde_json::Value], name: &str| -> BrokerResult<Decimal> {
                parse_decimal(arr.get(i).unwrap_or(&serde_json::Value::Null), name)
            };
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                // Dhan stamps seconds; candles store milliseconds.
                open_time: timestamps[i].as_i64().unwrap_or(0) * 1000,
                open: get(opens, "open")?,
                high: get(highs, "high")?,
                low: get(lows, "low")?,
                close: get(closes, "close")?,
                volume: volumes
                    .get(i)
                    .and_then(|v| v.as_f64())
                    .map(|f| f as i64)
                    .unwrap_or(0),
            });
        }
        Ok(candles)
    }

    async fn get_instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        let headers = self.auth_headers()?;
        let response = self
            .core
            .request(Method::GET, "/v2/instrument/NSE_EQ", &headers, &[], None)
            .await?;
        let mut instruments = Vec::new();
        for row in response.as_array().into_iter().flatten() {
            instruments.push(InstrumentRecord {
                exchange: "NSE".to_string(),
                trading_symbol: row
                    .get("tradingSymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .get("customSymbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                broker_token: serde_json::json!({
                    "security_id": row.get("securityId").cloned(),
                }),
                lot_size: row.get("lotSize").and_then(|v| v.as_i64()).unwrap_or(1),
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

impl std::fmt::Debug for DhanBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhanBroker")
            .field("client_id", &"<redacted>")
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
    fn ticker_parsing() {
        let json = r#"{
            "type": "Ticker",
            "tradingSymbol": "SBIN",
            "lastTradedPrice": 502.5,
            "lastTradedQty": 15,
            "bestBidPrice": 502.45,
            "bestAskPrice": 502.55,
            "lastTradeTime": 1700000000000
        }"#;
        let tick = DhanBroker::parse_tick(json).unwrap().unwrap();
        assert_eq!(tick.symbol, "SBIN");
        assert_eq!(tick.last_price, dec!(502.50));
        assert_eq!(tick.volume, 15);
        assert_eq!(tick.ask, Some(dec!(502.55)));
    }

    #[test]
    fn error_envelope_maps_to_rejection() {
        let body = serde_json::json!({
            "errorCode": "RMS:MARGIN_SHORTFALL",
            "errorMessage": "margin shortfall for order"
        });
        let err = DhanBroker::check_rejection(&body).unwrap_err();
        match err {
            BrokerError::Rejected { code, message } => {
                assert_eq!(code, "RMS:MARGIN_SHORTFALL");
                assert!(message.contains("margin shortfall"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn order_status_parsing_with_traded_status() {
        let order = serde_json::json!({
            "orderId": "112111182045",
            "orderStatus": "TRADED",
            "filledQty": 20,
            "averageTradedPrice": 502.5,
            "correlationId": "intent-1",
            "tradingSymbol": "SBIN"
        });
        let report = DhanBroker::order_status_from_json(&order).unwrap();
        assert_eq!(report.status, crate::types::BrokerOrderState::Filled);
        assert_eq!(report.tag.as_deref(), Some("intent-1"));
    }
}
