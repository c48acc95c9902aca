// =============================================================================
// Analytics collaborators — MTF evaluation and position sizing seams
// =============================================================================
//
// The numerical MTF analytics (probability, kelly, confluence scoring) live
// outside the core; the engine consumes them as pure functions behind these
// traits. The constitutional sizer ships with a deterministic default that
// returns the binding-constraint label alongside the quantity.
// =============================================================================

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::models::{log_return, MtfZoneSnapshot, Portfolio, Signal};
use crate::types::{ConfluenceType, Direction, SignalType, Timeframe};

/// The analytics collaborator's verdict for one (symbol, timeframe) sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub symbol: String,
    pub direction: Direction,
    pub signal_type: SignalType,
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
}

/// MTF analytics seam. Returns a candidate when the zones line up.
pub trait SignalAnalytics: Send + Sync {
    fn evaluate(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[crate::models::Candle],
        ltp: Option<Decimal>,
    ) -> Option<SignalCandidate>;
}

/// Analytics stub that never signals; used in FEED_COLLECTOR mode and tests
/// that drive the coordinator with hand-built candidates.
pub struct NullAnalytics;

impl SignalAnalytics for NullAnalytics {
    fn evaluate(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _candles: &[crate::models::Candle],
        _ltp: Option<Decimal>,
    ) -> Option<SignalCandidate> {
        None
    }
}

/// Quantity plus the constraint that bound it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeResult {
    pub quantity: i64,
    pub limiting_constraint: String,
}

/// Position sizing seam.
pub trait PositionSizer: Send + Sync {
    fn size(&self, signal: &Signal, portfolio: &Portfolio) -> PositionSizeResult;
}

/// Deterministic sizer: the quantity is the minimum over capital headroom,
/// exposure headroom, per-trade value cap, and the per-trade log-loss budget
/// at the effective floor. The label names whichever constraint bound.
pub struct ConstitutionalSizer {
    config: Arc<EngineConfig>,
}

impl ConstitutionalSizer {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }
}

impl PositionSizer for ConstitutionalSizer {
    fn size(&self, signal: &Signal, portfolio: &Portfolio) -> PositionSizeResult {
        let price = signal.ref_price;
        if price <= Decimal::ZERO {
            return PositionSizeResult {
                quantity: 0,
                limiting_constraint: "NO_REFERENCE_PRICE".into(),
            };
        }

        let floor_qty = |value: Decimal| -> i64 {
            (value / price).floor().to_i64().unwrap_or(0).max(0)
        };

        let by_capital = floor_qty(portfolio.available_capital);
        let exposure_headroom = (portfolio.total_capital * self.config.max_exposure_ratio
            - portfolio.current_exposure)
            .max(Decimal::ZERO);
        let by_exposure = floor_qty(exposure_headroom);
        let by_value_cap = floor_qty(self.config.max_trade_value);

        // Loss per share if the floor is hit; budget scales off total capital.
        let loss_per_share = (price - signal.effective_floor).abs();
        let by_log_loss = if loss_per_share > Decimal::ZERO {
            let budget = portfolio.total_capital * self.config.max_trade_log_loss;
            (budget / loss_per_share).floor().to_i64().unwrap_or(0).max(0)
        } else {
            i64::MAX
        };

        let candidates = [
            (by_capital, "AVAILABLE_CAPITAL"),
            (by_exposure, "EXPOSURE_HEADROOM"),
            (by_value_cap, "MAX_TRADE_VALUE"),
            (by_log_loss, "TRADE_LOG_LOSS_BUDGET"),
        ];
        let (quantity, label) = candidates
            .iter()
            .min_by_key(|(qty, _)| *qty)
            .copied()
            .expect("non-empty constraint list");

        PositionSizeResult {
            quantity,
            limiting_constraint: label.to_string(),
        }
    }
}

/// Price floor implied by spending the whole per-trade log-loss budget:
/// `ref * e^(-max_log_loss)` for longs.
pub fn log_loss_floor(ref_price: Decimal, max_log_loss: Decimal, direction: Direction) -> Decimal {
    let ref_f = ref_price.to_f64().unwrap_or(0.0);
    let budget = max_log_loss.to_f64().unwrap_or(0.0);
    let floor = match direction {
        Direction::Buy => ref_f * (-budget).exp(),
        Direction::Sell => ref_f * budget.exp(),
    };
    Decimal::try_from(floor)
        .map(|d| d.round_dp(2))
        .unwrap_or(ref_price)
}

/// Log impact of entering at `ref_price` with the stop at `floor`.
pub fn entry_log_impact(ref_price: Decimal, floor: Decimal) -> Decimal {
    log_return(ref_price, floor).abs()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal() -> Signal {
        use crate::types::{now_ms, SignalStatus};
        Signal {
            id: "s1".into(),
            symbol: "SBIN".into(),
            direction: Direction::Buy,
            signal_type: SignalType::Entry,
            status: SignalStatus::Active,
            signal_day: "2026-08-01".into(),
            zone: MtfZoneSnapshot::default(),
            confluence_type: ConfluenceType::Triple,
            confluence_score: dec!(0.8),
            p_win: dec!(0.62),
            p_fill: dec!(0.9),
            kelly: dec!(0.08),
            ref_price: dec!(500.00),
            bid: dec!(499.95),
            ask: dec!(500.05),
            entry_low: dec!(498.00),
            entry_high: dec!(503.00),
            effective_floor: dec!(490.00),
            effective_ceiling: dec!(520.00),
            reason: "test".into(),
            expires_at: now_ms() + 3_600_000,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    fn portfolio() -> Portfolio {
        use crate::types::now_ms;
        Portfolio {
            id: "p1".into(),
            user_id: "u1".into(),
            total_capital: dec!(100000.00),
            available_capital: dec!(100000.00),
            current_exposure: dec!(0.00),
            current_log_exposure: dec!(0.000000),
            open_trade_count: 0,
            daily_loss: dec!(0.00),
            weekly_loss: dec!(0.00),
            cooldown_until: None,
            paused: false,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn sizer_reports_binding_constraint() {
        let sizer = ConstitutionalSizer::new(Arc::new(EngineConfig::default()));
        let result = sizer.size(&signal(), &portfolio());
        // Exposure headroom (80% of 100k at 500) binds at 160 before capital
        // (200) and the value cap (400).
        assert_eq!(result.quantity, 160);
        assert_eq!(result.limiting_constraint, "EXPOSURE_HEADROOM");
    }

    #[test]
    fn sizer_respects_log_loss_budget() {
        let sizer = ConstitutionalSizer::new(Arc::new(EngineConfig::default()));
        let mut sig = signal();
        // A very deep floor makes the loss budget the binding constraint:
        // budget = 100000 * 0.025 = 2500; loss/share = 100 -> 25 shares.
        sig.effective_floor = dec!(400.00);
        let result = sizer.size(&sig, &portfolio());
        assert_eq!(result.quantity, 25);
        assert_eq!(result.limiting_constraint, "TRADE_LOG_LOSS_BUDGET");
    }

    #[test]
    fn sizer_zero_on_missing_price() {
        let sizer = ConstitutionalSizer::new(Arc::new(EngineConfig::default()));
        let mut sig = signal();
        sig.ref_price = Decimal::ZERO;
        let result = sizer.size(&sig, &portfolio());
        assert_eq!(result.quantity, 0);
    }

    #[test]
    fn null_analytics_never_signals() {
        let analytics = NullAnalytics;
        assert!(analytics
            .evaluate("SBIN", Timeframe::M5, &[], Some(dec!(500)))
            .is_none());
    }

    #[test]
    fn log_loss_floor_is_below_ref_for_longs() {
        let floor = log_loss_floor(dec!(500.00), dec!(0.020000), Direction::Buy);
        assert!(floor < dec!(500.00));
        assert!(floor > dec!(488.00));

        let short_floor = log_loss_floor(dec!(500.00), dec!(0.020000), Direction::Sell);
        assert!(short_floor > dec!(500.00));
    }

    #[test]
    fn entry_log_impact_is_positive() {
        let impact = entry_log_impact(dec!(500.00), dec!(490.00));
        assert!(impact > Decimal::ZERO);
        assert!(impact < dec!(0.03));
    }
}
