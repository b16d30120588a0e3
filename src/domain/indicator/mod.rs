//! Technical indicator kernels over contiguous price buffers.
//!
//! Every kernel takes a `&[f64]` series and returns a series of the same
//! length. Warmup positions and positions whose window touches a missing
//! input are `f64::NAN`, the same no-value marker the history cube uses.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod sma;
pub mod stddev;
pub mod trix;

pub use bollinger::{bollinger, BollingerBands};
pub use ema::ema;
pub use macd::{macd, Macd};
pub use roc::roc;
pub use sma::sma;
pub use stddev::stddev;
pub use trix::trix;

/// Index of the first non-NaN value, if any.
pub(crate) fn first_valid(values: &[f64]) -> Option<usize> {
    values.iter().position(|v| !v.is_nan())
}

#[cfg(test)]
pub(crate) fn assert_series_eq(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "series length");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        if e.is_nan() {
            assert!(a.is_nan(), "index {i}: expected NaN, got {a}");
        } else {
            assert!((a - e).abs() < 1e-9, "index {i}: expected {e}, got {a}");
        }
    }
}
