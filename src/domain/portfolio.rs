//! Portfolio state and the records the simulation emits.

use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

/// Positions and cash at the close of one simulated date. Quantities follow
/// the instrument order of the backtest.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Holdings {
    pub date: NaiveDate,
    pub quantities: Vec<f64>,
    pub cash: f64,
}

/// One executed fill. `quantity` is signed: positive buys, negative sells.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trade {
    pub date: NaiveDate,
    pub instrument: String,
    pub quantity: f64,
    pub price: f64,
    pub cost: f64,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.quantity.abs() * self.price
    }
}

/// Mutable simulation state for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    pub quantities: Vec<f64>,
    /// Last tradable price per instrument, NaN until first seen.
    pub last_prices: Vec<f64>,
    pub total_fees: f64,
}

impl Portfolio {
    pub fn new(initial_capital: f64, instruments: usize) -> Self {
        Portfolio {
            cash: initial_capital,
            initial_capital,
            quantities: vec![0.0; instruments],
            last_prices: vec![f64::NAN; instruments],
            total_fees: 0.0,
        }
    }

    /// Market value of instrument `i` at its last known price.
    pub fn position_value(&self, i: usize) -> f64 {
        let (q, p) = (self.quantities[i], self.last_prices[i]);
        if q == 0.0 || p.is_nan() { 0.0 } else { q * p }
    }

    pub fn total_equity(&self) -> f64 {
        self.cash
            + (0..self.quantities.len())
                .map(|i| self.position_value(i))
                .sum::<f64>()
    }

    /// Current weight of every instrument in total equity.
    pub fn weights(&self) -> Vec<f64> {
        let equity = self.total_equity();
        (0..self.quantities.len())
            .map(|i| {
                if equity > 0.0 {
                    self.position_value(i) / equity
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Apply a fill to cash and quantity.
    pub fn apply_fill(&mut self, i: usize, quantity: f64, price: f64, fee: f64) {
        self.cash -= quantity * price + fee;
        self.quantities[i] += quantity;
        self.total_fees += fee;
    }

    pub fn snapshot(&self, date: NaiveDate) -> Holdings {
        Holdings {
            date,
            quantities: self.quantities.clone(),
            cash: self.cash,
        }
    }
}
