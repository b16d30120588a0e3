//! Rate of change over n periods, as a fraction.
//!
//! ROC(n)[i] = (x[i] - x[i-n]) / x[i-n]; NaN when either end is missing or
//! the base is zero.

pub fn roc(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in period..values.len() {
        let (base, curr) = (values[i - period], values[i]);
        if base.is_finite() && curr.is_finite() && base != 0.0 {
            out[i] = (curr - base) / base;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::assert_series_eq;

    const NAN: f64 = f64::NAN;

    #[test]
    fn roc_basic() {
        let out = roc(&[100.0, 110.0, 121.0, 99.0], 1);
        assert_series_eq(&out, &[NAN, 0.1, 0.1, -0.18181818181818182]);
    }

    #[test]
    fn roc_multi_period() {
        let out = roc(&[100.0, 50.0, 150.0], 2);
        assert_series_eq(&out, &[NAN, NAN, 0.5]);
    }

    #[test]
    fn roc_zero_base_is_no_value() {
        let out = roc(&[0.0, 10.0], 1);
        assert!(out[1].is_nan());
    }

    #[test]
    fn roc_period_0_is_zero_change() {
        let out = roc(&[3.0, 4.0], 0);
        assert_series_eq(&out, &[0.0, 0.0]);
    }
}
