//! Exponential moving average.
//!
//! k = 2/(n+1), seeded with the SMA of the first n values after any leading
//! gap, then EMA[i] = x[i]*k + EMA[i-1]*(1-k). A missing value after the
//! seed yields NaN at that position and leaves the running average intact.

use super::first_valid;

pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }
    let Some(start) = first_valid(values) else {
        return out;
    };
    let seed_end = start + period;
    if seed_end > values.len() {
        return out;
    }
    let seed = &values[start..seed_end];
    if seed.iter().any(|v| v.is_nan()) {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut current = seed.iter().sum::<f64>() / period as f64;
    out[seed_end - 1] = current;
    for i in seed_end..values.len() {
        let v = values[i];
        if v.is_nan() {
            continue;
        }
        current = v * k + current * (1.0 - k);
        out[i] = current;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::assert_series_eq;

    const NAN: f64 = f64::NAN;

    #[test]
    fn ema_seed_is_sma() {
        let out = ema(&[10.0, 20.0, 30.0], 3);
        assert_series_eq(&out, &[NAN, NAN, 20.0]);
    }

    #[test]
    fn ema_recursive_calculation() {
        let out = ema(&[10.0, 20.0, 30.0, 40.0, 50.0], 3);
        let k = 0.5;
        let e3 = 40.0 * k + 20.0 * (1.0 - k);
        let e4 = 50.0 * k + e3 * (1.0 - k);
        assert_series_eq(&out, &[NAN, NAN, 20.0, e3, e4]);
    }

    #[test]
    fn ema_period_1_tracks_input() {
        let out = ema(&[10.0, 20.0, 30.0], 1);
        assert_series_eq(&out, &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn ema_skips_leading_gap() {
        let out = ema(&[NAN, NAN, 2.0, 4.0, 6.0], 2);
        assert_series_eq(&out, &[NAN, NAN, NAN, 3.0, 3.0 * (1.0 / 3.0) + 6.0 * (2.0 / 3.0)]);
    }

    #[test]
    fn ema_equal_prices() {
        let out = ema(&[100.0; 5], 3);
        assert_series_eq(&out, &[NAN, NAN, 100.0, 100.0, 100.0]);
    }

    #[test]
    fn ema_empty_and_period_0() {
        assert!(ema(&[], 3).is_empty());
        assert!(ema(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
    }
}
