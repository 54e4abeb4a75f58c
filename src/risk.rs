//! Position sizing and stop capping
//!
//! Pure functions, no broker or state access. Sizing caps the dollar risk at
//! the lesser of a percentage of equity and an absolute USD ceiling; stop
//! capping bounds the stop distance to a multiple of ATR.

use serde::{Deserialize, Serialize};

use crate::orders::OrderSide;

/// Risk parameters pulled from the `trading` config section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account equity in USD used as the sizing base
    pub account_equity: f64,
    /// Percent of equity risked per trade (1.0 = 1%)
    pub risk_per_trade_percent: f64,
    /// Absolute dollar risk ceiling per trade
    pub max_risk_usd: f64,
    /// Max stop distance as a multiple of ATR (0 disables capping)
    pub max_stop_atr: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_equity: 100_000.0,
            risk_per_trade_percent: 1.0,
            max_risk_usd: 500.0,
            max_stop_atr: 0.0,
        }
    }
}

impl RiskConfig {
    /// Dollar amount at risk for a single trade
    pub fn risk_amount(&self) -> f64 {
        (self.account_equity * self.risk_per_trade_percent / 100.0).min(self.max_risk_usd)
    }
}

/// Round a price to cents
pub fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Share quantity for a given stop distance.
///
/// Returns 0 when the stop distance is not positive, otherwise at least 1.
pub fn quantity(stop_distance: f64, equity: f64, risk_pct: f64, max_risk_usd: f64) -> i64 {
    if stop_distance <= 0.0 {
        return 0;
    }

    let risk_amount = (equity * risk_pct / 100.0).min(max_risk_usd);
    let shares = (risk_amount / stop_distance).floor() as i64;
    shares.max(1)
}

/// Same as [`quantity`] with parameters taken from a [`RiskConfig`]
pub fn quantity_for(stop_distance: f64, risk: &RiskConfig) -> i64 {
    quantity(
        stop_distance,
        risk.account_equity,
        risk.risk_per_trade_percent,
        risk.max_risk_usd,
    )
}

/// Bound the stop distance to `atr * max_stop_atr`.
///
/// A stop further than the limit is pulled in to exactly the limit on the
/// protective side of the entry. Without a multiplier or ATR the raw stop is
/// returned rounded to cents.
pub fn capped_stop(
    entry_price: f64,
    raw_stop: f64,
    side: OrderSide,
    atr: f64,
    max_stop_atr: f64,
) -> f64 {
    if max_stop_atr <= 0.0 || atr <= 0.0 {
        return round_price(raw_stop);
    }

    let limit_distance = atr * max_stop_atr;
    let raw_distance = (entry_price - raw_stop).abs();

    if raw_distance > limit_distance {
        let capped = match side {
            OrderSide::Buy => entry_price - limit_distance,
            OrderSide::Sell => entry_price + limit_distance,
        };
        return round_price(capped);
    }

    round_price(raw_stop)
}
