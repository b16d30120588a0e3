//! Fill simulation: transaction fees, slippage and lot-size truncation.
//!
//! Fees and slippage are charged per trade. Rates are fractions, so a fee
//! rate of 0.0003 is 3 basis points.

use std::collections::HashMap;

/// Price degradation applied to every fill.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlippageModel {
    #[default]
    None,
    /// Buys fill at `price * (1 + pct)`, sells at `price * (1 - pct)`.
    Proportional(f64),
    /// Buys fill at `price + amount`, sells at `price - amount` (floored at 0).
    FixedPerUnit(f64),
}

impl SlippageModel {
    /// Execution price for a signed trade quantity.
    pub fn fill_price(&self, market_price: f64, quantity: f64) -> f64 {
        let buy = quantity > 0.0;
        match *self {
            SlippageModel::None => market_price,
            SlippageModel::Proportional(pct) if buy => market_price * (1.0 + pct),
            SlippageModel::Proportional(pct) => market_price * (1.0 - pct),
            SlippageModel::FixedPerUnit(amount) if buy => market_price + amount,
            SlippageModel::FixedPerUnit(amount) => (market_price - amount).max(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CostModel {
    /// Proportional fee on traded notional.
    pub fee_rate: f64,
    /// Flat fee added to every trade.
    pub fixed_fee: f64,
    /// Lower bound on the fee of any single trade.
    pub min_fee: f64,
    pub slippage: SlippageModel,
}

/// Fee for one trade: `max(notional * rate + fixed, min_fee)`; nothing traded costs nothing.
pub fn calculate_fee(notional: f64, costs: &CostModel) -> f64 {
    if notional <= 0.0 {
        return 0.0;
    }
    (notional * costs.fee_rate + costs.fixed_fee).max(costs.min_fee)
}

/// Cash needed to buy `quantity` at `fill_price`, fee included.
pub fn buy_cost(quantity: f64, fill_price: f64, costs: &CostModel) -> f64 {
    let notional = quantity * fill_price;
    notional + calculate_fee(notional, costs)
}

/// Largest quantity whose cost including fees fits in `cash`, before lot truncation.
pub fn affordable_quantity(cash: f64, fill_price: f64, costs: &CostModel) -> f64 {
    if cash <= 0.0 || fill_price <= 0.0 {
        return 0.0;
    }
    let by_rate = (cash - costs.fixed_fee) / (fill_price * (1.0 + costs.fee_rate));
    let by_min = (cash - costs.min_fee) / fill_price;
    by_rate.min(by_min).max(0.0)
}

/// Minimum tradable unit per instrument.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LotSizes {
    pub default: f64,
    pub overrides: HashMap<String, f64>,
    /// Keep sub-lot remainders instead of truncating them.
    pub allow_fractional: bool,
}

impl Default for LotSizes {
    fn default() -> Self {
        LotSizes {
            default: 1.0,
            overrides: HashMap::new(),
            allow_fractional: false,
        }
    }
}

impl LotSizes {
    pub fn lot(&self, instrument: &str) -> f64 {
        self.overrides.get(instrument).copied().unwrap_or(self.default)
    }

    /// Truncate toward zero to a whole number of lots. With fractional
    /// trading enabled the quantity passes through unchanged.
    pub fn truncate(&self, instrument: &str, quantity: f64) -> f64 {
        if self.allow_fractional {
            return quantity;
        }
        let lot = self.lot(instrument);
        if lot <= 0.0 {
            return quantity;
        }
        // tolerate representation error just below a lot boundary
        (quantity / lot + quantity.signum() * 1e-9).trunc() * lot
    }

    /// One step down from `quantity`: one lot, or a tiny fraction when fractional.
    pub fn step_down(&self, instrument: &str, quantity: f64) -> f64 {
        if self.allow_fractional {
            quantity * (1.0 - 1e-9)
        } else {
            quantity - self.lot(instrument)
        }
    }
}
