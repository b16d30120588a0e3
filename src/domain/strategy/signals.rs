//! Signal-generating strategies: discrete buy (+1) / sell (-1) events.

use crate::domain::error::QtsimError;
use crate::domain::indicator::bollinger;
use crate::domain::parameter::ParameterVector;

/// Band re-entry crossings of the (close + high + low) / 3 price.
///
/// -1 when the price drops back under the upper band, +1 when it climbs back
/// over the lower band.
pub(super) fn bband(
    close: &[f64],
    high: &[f64],
    low: &[f64],
    params: &ParameterVector,
) -> Result<Vec<f64>, QtsimError> {
    let span = params.period(0)?;
    let (up, down) = (params.float(1)?, params.float(2)?);
    let avg: Vec<f64> = close
        .iter()
        .zip(high)
        .zip(low)
        .map(|((c, h), l)| (c + h + l) / 3.0)
        .collect();
    let bands = bollinger(&avg, span, up, down);

    let mut out = vec![0.0; avg.len()];
    for t in 1..avg.len() {
        let (prev, curr) = (avg[t - 1], avg[t]);
        if prev >= bands.upper[t - 1] && curr < bands.upper[t] {
            out[t] = -1.0;
        } else if prev <= bands.lower[t - 1] && curr > bands.lower[t] {
            out[t] = 1.0;
        }
    }
    Ok(out)
}

/// Sell when the change over `n` days, relative to today's price, falls
/// below `drop`.
pub(super) fn urgent(close: &[f64], params: &ParameterVector) -> Result<Vec<f64>, QtsimError> {
    let n = params.period(0)?;
    let drop = params.float(1)?;
    let mut out = vec![0.0; close.len()];
    for t in n..close.len() {
        let change = (close[t] - close[t - n]) / close[t];
        if change < drop {
            out[t] = -1.0;
        }
    }
    Ok(out)
}
