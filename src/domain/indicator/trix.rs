//! TRIX: one-period rate of change of a triple-smoothed EMA, in percent.

use super::ema;

pub fn trix(values: &[f64], period: usize) -> Vec<f64> {
    let triple = ema(&ema(&ema(values, period), period), period);
    let mut out = vec![f64::NAN; values.len()];
    for i in 1..triple.len() {
        let (prev, curr) = (triple[i - 1], triple[i]);
        if prev.is_finite() && curr.is_finite() && prev != 0.0 {
            out[i] = (curr - prev) / prev * 100.0;
        }
    }
    out
}
