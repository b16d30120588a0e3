//! MACD (Moving Average Convergence Divergence).
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of MACD Line
//! Histogram = MACD Line - Signal Line
//!
//! Default parameters: fast=12, slow=26, signal=9

use super::ema;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> Macd {
    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);
    let line: Vec<f64> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&line, signal_period);
    let histogram = line.iter().zip(&signal).map(|(l, s)| l - s).collect();
    Macd {
        line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn macd_warmup_is_slow_plus_signal() {
        let m = macd(&ramp(40), DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL);
        let warmup = DEFAULT_SLOW - 1 + DEFAULT_SIGNAL - 1;
        assert!(m.histogram[..warmup].iter().all(|v| v.is_nan()));
        assert!(m.histogram[warmup..].iter().all(|v| v.is_finite()));
        assert!(m.line[DEFAULT_SLOW - 1].is_finite());
    }

    #[test]
    fn macd_line_positive_in_uptrend() {
        let m = macd(&ramp(60), 3, 6, 3);
        assert!(m.line[59] > 0.0);
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let m = macd(&[50.0; 30], 3, 6, 3);
        for v in m.histogram.iter().skip(7) {
            assert!(v.abs() < 1e-12);
        }
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let m = macd(&ramp(30), 2, 4, 2);
        for i in 0..30 {
            if m.histogram[i].is_finite() {
                assert!((m.histogram[i] - (m.line[i] - m.signal[i])).abs() < 1e-12);
            }
        }
    }
}
