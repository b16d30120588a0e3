//! Bollinger Bands.
//!
//! Middle = SMA(n); Upper = Middle + upper_mult × StdDev(n);
//! Lower = Middle - lower_mult × StdDev(n). StdDev is the population form.

use super::{sma, stddev};

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(values: &[f64], period: usize, upper_mult: f64, lower_mult: f64) -> BollingerBands {
    let middle = sma(values, period);
    let dev = stddev(values, period);
    let upper = middle.iter().zip(&dev).map(|(m, d)| m + upper_mult * d).collect();
    let lower = middle.iter().zip(&dev).map(|(m, d)| m - lower_mult * d).collect();
    BollingerBands {
        upper,
        middle,
        lower,
    }
}
