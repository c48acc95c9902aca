// =============================================================================
// Shared REST plumbing for broker adapters
// =============================================================================
//
// Wraps one reqwest client with the cross-cutting concerns every adapter
// needs: cached access token, bounded concurrent-call semaphore, rate-limit
// pre-flight, per-call deadline, and mapping of transport/HTTP failures into
// the categorical broker error kinds.
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Method;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::rate_limit::{RateLimitTracker, RateLimits};
use super::{BrokerError, BrokerResult};

/// Common state composed into every REST adapter.
pub struct RestCore {
    pub base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
    semaphore: Arc<Semaphore>,
    limits: RateLimitTracker,
    deadline: Duration,
    feed_stale: Arc<AtomicBool>,
}

impl RestCore {
    pub fn new(base_url: impl Into<String>, permits: usize, limits: RateLimits, deadline: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
            token: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            limits: RateLimitTracker::new(limits),
            deadline,
            // Stale until the first stream connects.
            feed_stale: Arc::new(AtomicBool::new(true)),
        }
    }

    // -------------------------------------------------------------------------
    // Token & staleness
    // -------------------------------------------------------------------------

    pub fn set_token(&self, token: &str) {
        *self.token.write() = Some(token.to_string());
    }

    pub fn token(&self) -> BrokerResult<String> {
        self.token
            .read()
            .clone()
            .ok_or_else(|| BrokerError::NotAuthenticated("no access token loaded".into()))
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn set_feed_stale(&self, stale: bool) {
        self.feed_stale.store(stale, Ordering::Relaxed);
    }

    pub fn is_feed_stale(&self) -> bool {
        self.feed_stale.load(Ordering::Relaxed)
    }

    /// Shared READ-ONLY predicate: orders need a token and a live feed.
    pub fn can_place_orders(&self) -> bool {
        self.has_token() && !self.is_feed_stale()
    }

    pub fn stale_flag(&self) -> Arc<AtomicBool> {
        self.feed_stale.clone()
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Issue one JSON request. Applies rate-limit pre-flight, the concurrent
    /// call cap and the deadline; maps failures to categorical kinds.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, String)],
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> BrokerResult<serde_json::Value> {
        if !self.limits.try_acquire() {
            return Err(BrokerError::RateLimited(format!(
                "local budget exhausted for {path}"
            )));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BrokerError::Connection("adapter shut down".into()))?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        debug!(method = %method, url = %url, "broker request");

        let response = tokio::time::timeout(self.deadline, req.send())
            .await
            .map_err(|_| BrokerError::Timeout(self.deadline))?
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Timeout(self.deadline)
                } else {
                    BrokerError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        let message = extract_message(&body).unwrap_or_else(|| status.to_string());
        let err = match status.as_u16() {
            401 => BrokerError::TokenExpired(message),
            403 => BrokerError::NotAuthenticated(message),
            429 => BrokerError::RateLimited(message),
            400 | 422 => BrokerError::Rejected {
                code: extract_code(&body).unwrap_or_else(|| "INVALID_ORDER".into()),
                message,
            },
            _ => BrokerError::Rejected {
                code: extract_code(&body).unwrap_or_else(|| status.as_u16().to_string()),
                message,
            },
        };
        warn!(url = %url, status = %status, error = %err, "broker request failed");
        Err(err)
    }
}

impl std::fmt::Debug for RestCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCore")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("feed_stale", &self.is_feed_stale())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Best-effort human message from the common Indian-broker error envelopes.
fn extract_message(body: &serde_json::Value) -> Option<String> {
    for key in ["message", "error", "errorMessage", "remarks"] {
        if let Some(s) = body.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

/// Best-effort machine code from the common error envelopes.
fn extract_code(body: &serde_json::Value) -> Option<String> {
    for key in ["error_type", "errorType", "errorCode", "code", "s"] {
        if let Some(s) = body.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

/// Parse a JSON value that may be either a string or a number into Decimal.
pub fn parse_decimal(val: &serde_json::Value, name: &str) -> BrokerResult<Decimal> {
    match val {
        serde_json::Value::String(s) => Decimal::from_str(s)
            .map_err(|e| BrokerError::Connection(format!("bad decimal in {name}: {e}"))),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| BrokerError::Connection(format!("bad decimal in {name}: {e}"))),
        _ => Err(BrokerError::Connection(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

/// Same as [`parse_decimal`] but tolerates a missing/null field.
pub fn parse_decimal_opt(val: &serde_json::Value, name: &str) -> BrokerResult<Option<Decimal>> {
    if val.is_null() {
        return Ok(None);
    }
    parse_decimal(val, name).map(Some)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn decimal_parsing_accepts_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("502.50"), "p").unwrap(), dec!(502.50));
        assert_eq!(parse_decimal(&json!(20), "q").unwrap(), dec!(20));
        assert!(parse_decimal(&json!({"x": 1}), "bad").is_err());
        assert_eq!(parse_decimal_opt(&serde_json::Value::Null, "p").unwrap(), None);
    }

    #[test]
    fn error_envelope_extraction() {
        let kite = json!({"status": "error", "message": "Insufficient funds", "error_type": "InputException"});
        assert_eq!(extract_message(&kite).as_deref(), Some("Insufficient funds"));
        assert_eq!(extract_code(&kite).as_deref(), Some("InputException"));

        let dhan = json!({"errorCode": "RMS:MARGIN_SHORTFALL", "errorMessage": "margin shortfall"});
        assert_eq!(extract_code(&dhan).as_deref(), Some("RMS:MARGIN_SHORTFALL"));
        assert_eq!(extract_message(&dhan).as_deref(), Some("margin shortfall"));
    }

    #[test]
    fn read_only_until_token_and_feed() {
        let core = RestCore::new(
            "https://api.example",
            2,
            RateLimits::default(),
            Duration::from_secs(10),
        );
        assert!(!core.can_place_orders());
        core.set_token("tok");
        assert!(!core.can_place_orders());
        core.set_feed_stale(false);
        assert!(core.can_place_orders());
        core.set_feed_stale(true);
        assert!(!core.can_place_orders());
    }

    #[test]
    fn token_errors_when_absent() {
        let core = RestCore::new(
            "https://api.example",
            2,
            RateLimits::default(),
            Duration::from_secs(10),
        );
        assert!(matches!(
            core.token(),
            Err(BrokerError::NotAuthenticated(_))
        ));
        core.set_token("tok");
        assert_eq!(core.token().unwrap(), "tok");
    }
}
