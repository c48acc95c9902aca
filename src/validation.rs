// =============================================================================
// Validator — the policy pipeline behind trade-intent creation
// =============================================================================
//
// Every check runs; every failure contributes a typed error. The outcome is
// a value, never an exception: the orchestrator persists a REJECTED intent
// carrying the full error list when anything failed.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analytics::{entry_log_impact, PositionSizer};
use crate::config::EngineConfig;
use crate::models::{Portfolio, Signal, UserBroker, ValidationError};
use crate::types::{now_ms, ConfluenceType, OrderType, ProductType, SignalType};

/// Everything the orchestrator needs to mint a trade intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub errors: Vec<ValidationError>,
    pub calculated_qty: i64,
    pub calculated_value: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product_type: ProductType,
    pub log_impact: Decimal,
    pub portfolio_exposure_after: Decimal,
    pub limiting_constraint: String,
}

pub struct Validator {
    config: Arc<EngineConfig>,
    sizer: Arc<dyn PositionSizer>,
}

impl Validator {
    pub fn new(config: Arc<EngineConfig>, sizer: Arc<dyn PositionSizer>) -> Self {
        Self { config, sizer }
    }

    /// Run the full pipeline for one delivery.
    pub fn validate(
        &self,
        signal: &Signal,
        user_broker: &UserBroker,
        portfolio: &Portfolio,
        adapter_connected: bool,
    ) -> ValidationOutcome {
        let mut errors: Vec<ValidationError> = Vec::new();
        let cfg = &self.config;

        // --- connection & eligibility ---------------------------------------
        if !adapter_connected {
            errors.push(ValidationError::new(
                "CONNECTION_DOWN",
                format!("broker adapter for {} is not connected", user_broker.id),
            ));
        }
        if !user_broker
            .allowed_symbols
            .iter()
            .any(|s| s == &signal.symbol)
        {
            errors.push(ValidationError::new(
                "SYMBOL_NOT_ALLOWED",
                format!("{} is not in the allowed list", signal.symbol),
            ));
        }

        // --- signal quality ---------------------------------------------------
        if cfg.require_triple_confluence
            && signal.signal_type == SignalType::Entry
            && signal.confluence_type != ConfluenceType::Triple
        {
            errors.push(ValidationError::new(
                "CONFLUENCE_BELOW_REQUIRED",
                format!("confluence {} where TRIPLE is required", signal.confluence_type),
            ));
        }
        if signal.p_win < cfg.min_p_win {
            errors.push(ValidationError::new(
                "P_WIN_BELOW_MIN",
                format!("p_win {} below minimum {}", signal.p_win, cfg.min_p_win),
            ));
        }
        if signal.kelly < cfg.min_kelly {
            errors.push(ValidationError::new(
                "KELLY_BELOW_MIN",
                format!("kelly {} below minimum {}", signal.kelly, cfg.min_kelly),
            ));
        }

        // --- sizing ----------------------------------------------------------
        let size = self.sizer.size(signal, portfolio);
        let qty = size.quantity;
        let value = (signal.ref_price * Decimal::from(qty)).round_dp(2);

        if qty <= 0 {
            errors.push(ValidationError::new(
                "SIZER_ZERO_QTY",
                format!("sizer produced no quantity ({})", size.limiting_constraint),
            ));
        }
        if qty > 0 && qty < cfg.min_trade_qty {
            errors.push(ValidationError::new(
                "QTY_BELOW_MIN",
                format!("qty {qty} below minimum {}", cfg.min_trade_qty),
            ));
        }
        if qty > 0 && value < cfg.min_trade_value {
            errors.push(ValidationError::new(
                "VALUE_BELOW_MIN",
                format!("value {value} below minimum {}", cfg.min_trade_value),
            ));
        }
        if value > cfg.max_trade_value {
            errors.push(ValidationError::new(
                "VALUE_ABOVE_MAX",
                format!("value {value} above cap {}", cfg.max_trade_value),
            ));
        }

        // --- portfolio state --------------------------------------------------
        if value > portfolio.available_capital {
            errors.push(ValidationError::new(
                "INSUFFICIENT_CAPITAL",
                format!(
                    "value {value} exceeds available capital {}",
                    portfolio.available_capital
                ),
            ));
        }

        let exposure_after = (portfolio.current_exposure + value).round_dp(2);
        let exposure_cap = portfolio.total_capital * cfg.max_exposure_ratio;
        if exposure_after > exposure_cap {
            errors.push(ValidationError::new(
                "MAX_EXPOSURE_EXCEEDED",
                format!("exposure {exposure_after} exceeds cap {exposure_cap}"),
            ));
        }
        if portfolio.open_trade_count >= cfg.max_open_trades {
            errors.push(ValidationError::new(
                "MAX_OPEN_TRADES",
                format!(
                    "{} open trades at limit {}",
                    portfolio.open_trade_count, cfg.max_open_trades
                ),
            ));
        }

        // --- log-loss budgets -------------------------------------------------
        let log_impact = entry_log_impact(signal.ref_price, signal.effective_floor);
        if log_impact > cfg.max_trade_log_loss {
            errors.push(ValidationError::new(
                "TRADE_LOG_LOSS_EXCEEDED",
                format!(
                    "log impact {log_impact} exceeds per-trade budget {}",
                    cfg.max_trade_log_loss
                ),
            ));
        }
        if portfolio.current_log_exposure + log_impact > cfg.max_portfolio_log_loss {
            errors.push(ValidationError::new(
                "PORTFOLIO_LOG_LOSS_EXCEEDED",
                format!(
                    "portfolio log exposure would reach {}",
                    portfolio.current_log_exposure + log_impact
                ),
            ));
        }

        // --- loss limits & cooldown --------------------------------------------
        let daily_cap = portfolio.total_capital * cfg.daily_loss_limit_ratio;
        if portfolio.daily_loss >= daily_cap {
            errors.push(ValidationError::new(
                "DAILY_LOSS_LIMIT",
                format!("daily loss {} at limit {daily_cap}", portfolio.daily_loss),
            ));
        }
        let weekly_cap = portfolio.total_capital * cfg.weekly_loss_limit_ratio;
        if portfolio.weekly_loss >= weekly_cap {
            errors.push(ValidationError::new(
                "WEEKLY_LOSS_LIMIT",
                format!("weekly loss {} at limit {weekly_cap}", portfolio.weekly_loss),
            ));
        }
        if let Some(cooldown_until) = portfolio.cooldown_until {
            if cooldown_until > now_ms() {
                errors.push(ValidationError::new(
                    "COOLDOWN_ACTIVE",
                    format!("portfolio cooling down until {cooldown_until}"),
                ));
            }
        }
        if portfolio.paused {
            errors.push(ValidationError::new(
                "PORTFOLIO_PAUSED",
                "portfolio is paused".to_string(),
            ));
        }

        let passed = errors.is_empty();
        debug!(
            signal_id = %signal.id,
            user_broker_id = %user_broker.id,
            passed,
            error_count = errors.len(),
            qty,
            "validation complete"
        );

        ValidationOutcome {
            passed,
            errors,
            calculated_qty: qty,
            calculated_value: value,
            order_type: OrderType::Market,
            limit_price: None,
            product_type: user_broker.product_type,
            log_impact,
            portfolio_exposure_after: exposure_after,
            limiting_constraint: size.limiting_constraint,
        }
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish()
    }
}
