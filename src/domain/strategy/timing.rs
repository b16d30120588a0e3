//! Timing strategies: one position target per instrument and date.
//!
//! Comparisons against NaN are false, so warmup and gaps fall out as 0.

use super::BuiltinStrategy;
use crate::domain::error::QtsimError;
use crate::domain::indicator::{macd, sma, trix};
use crate::domain::parameter::ParameterVector;

pub(super) fn column(
    kind: BuiltinStrategy,
    close: &[f64],
    len: usize,
    params: &ParameterVector,
) -> Result<Vec<f64>, QtsimError> {
    let out = match kind {
        BuiltinStrategy::Long => vec![1.0; len],
        BuiltinStrategy::Short => vec![-1.0; len],
        BuiltinStrategy::Zero => vec![0.0; len],
        BuiltinStrategy::Crossline => crossline(close, params)?,
        BuiltinStrategy::Macd => {
            let m = macd(close, params.period(0)?, params.period(1)?, params.period(2)?);
            m.histogram.iter().map(|h| long_if(*h > 0.0)).collect()
        }
        BuiltinStrategy::Trix => {
            let t = trix(close, params.period(0)?);
            let ma = sma(&t, params.period(1)?);
            t.iter().zip(&ma).map(|(t, m)| long_if(t > m)).collect()
        }
        BuiltinStrategy::Dma => {
            let dma: Vec<f64> = sma(close, params.period(0)?)
                .iter()
                .zip(sma(close, params.period(1)?))
                .map(|(s, l)| s - l)
                .collect();
            let ama = sma(&dma, params.period(2)?);
            dma.iter().zip(&ama).map(|(d, a)| long_if(d > a)).collect()
        }
        other => {
            return Err(QtsimError::breach(format!("{other} is not a timing strategy")));
        }
    };
    Ok(out)
}

/// Long while `sma(l) - sma(s)` is below the hesitation margin.
///
/// `hesitate` picks the margin: `buy` requires the short line to clear the
/// long line by `m`, `sell` holds until the short line falls `m` below it,
/// `none` uses a zero margin.
fn crossline(close: &[f64], params: &ParameterVector) -> Result<Vec<f64>, QtsimError> {
    let short = sma(close, params.period(0)?);
    let long = sma(close, params.period(1)?);
    let m = params.float(2)?;
    let margin = match params.category(3)? {
        "buy" => -m,
        "sell" => m,
        _ => 0.0,
    };
    Ok(long
        .iter()
        .zip(&short)
        .map(|(l, s)| long_if(l - s < margin))
        .collect())
}

/// One instrument's candles over the window.
pub(super) struct Candles<'a> {
    pub open: &'a [f64],
    pub high: &'a [f64],
    pub low: &'a [f64],
    pub close: &'a [f64],
}

/// A doji: the body is at most a tenth of the day's range.
fn is_doji(open: f64, high: f64, low: f64, close: f64) -> bool {
    let range = high - low;
    range > 0.0 && (close - open).abs() <= 0.1 * range
}

/// Long while at least one doji appeared in the trailing `n` days.
pub(super) fn cdl(candles: &Candles<'_>, params: &ParameterVector) -> Result<Vec<f64>, QtsimError> {
    let n = params.period(0)?;
    let len = candles.close.len();
    let mut last_doji: Option<usize> = None;
    let mut out = vec![0.0; len];
    for t in 0..len {
        if is_doji(candles.open[t], candles.high[t], candles.low[t], candles.close[t]) {
            last_doji = Some(t);
        }
        out[t] = long_if(last_doji.is_some_and(|d| t - d < n));
    }
    Ok(out)
}

fn long_if(cond: bool) -> f64 {
    if cond { 1.0 } else { 0.0 }
}
