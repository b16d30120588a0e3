//! Selecting strategies: per-date allocation weights over the window's
//! instruments. Chosen instruments share the row equally; rows sum to 1 or 0.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::BuiltinStrategy;
use crate::domain::error::QtsimError;
use crate::domain::history::HistoryCube;
use crate::domain::indicator::{roc, sma};
use crate::domain::parameter::ParameterVector;
use crate::domain::signal::SignalMatrix;

pub(super) fn fill(
    kind: BuiltinStrategy,
    window: &HistoryCube,
    params: &ParameterVector,
    out: &mut SignalMatrix,
) -> Result<(), QtsimError> {
    let (n_dates, n_inst) = out.shape();
    match kind {
        BuiltinStrategy::SelectNone => {}
        BuiltinStrategy::SelectAll => {
            for d in 0..n_dates {
                equal_weights(out.row_mut(d), &(0..n_inst).collect::<Vec<_>>());
            }
        }
        BuiltinStrategy::SelectRandom => {
            let p = params.float(0)?;
            let mut rng = StdRng::seed_from_u64(params.int(1)? as u64);
            for d in 0..n_dates {
                let chosen: Vec<usize> = if p < 1.0 {
                    (0..n_inst).filter(|_| rng.gen_bool(p)).collect()
                } else {
                    let k = (p as usize).min(n_inst);
                    let mut picks = rand::seq::index::sample(&mut rng, n_inst, k).into_vec();
                    picks.sort_unstable();
                    picks
                };
                equal_weights(out.row_mut(d), &chosen);
            }
        }
        BuiltinStrategy::SelectLastOpen
        | BuiltinStrategy::SelectLastClose
        | BuiltinStrategy::SelectLastHigh
        | BuiltinStrategy::SelectLastLow => {
            let factors = factor_columns(kind, window, |series| Ok(series.to_vec()))?;
            select_by_factor(&factors, params.period(0)?, params.category(1)?, out);
        }
        BuiltinStrategy::SelectNdayChange
        | BuiltinStrategy::SelectAvgOpen
        | BuiltinStrategy::SelectAvgClose
        | BuiltinStrategy::SelectAvgHigh
        | BuiltinStrategy::SelectAvgLow => {
            let n = params.period(0)?;
            let factors = factor_columns(kind, window, |series| {
                Ok(match kind {
                    BuiltinStrategy::SelectNdayChange => roc(series, n),
                    _ => sma(series, n),
                })
            })?;
            select_by_factor(&factors, params.period(1)?, params.category(2)?, out);
        }
        BuiltinStrategy::SelectFinance => {
            let n = params.period(0)?;
            let condition = params.category(3)?;
            let (lower, upper) = (params.float(4)?, params.float(5)?);
            let factors = factor_columns(kind, window, |series| {
                Ok(trailing_mean(series, n)
                    .into_iter()
                    .map(|f| if passes(condition, f, lower, upper) { f } else { f64::NAN })
                    .collect())
            })?;
            select_by_factor(&factors, params.period(1)?, params.category(2)?, out);
        }
        other => {
            return Err(QtsimError::breach(format!("{other} is not a selecting strategy")));
        }
    }
    Ok(())
}

/// One factor series per window instrument, computed from the selector's field.
fn factor_columns(
    kind: BuiltinStrategy,
    window: &HistoryCube,
    factor: impl Fn(&[f64]) -> Result<Vec<f64>, QtsimError>,
) -> Result<Vec<Vec<f64>>, QtsimError> {
    let field = kind
        .factor_field()
        .ok_or_else(|| QtsimError::breach(format!("{kind} ranks by no field")))?;
    let f = window.require_field(field)?;
    (0..window.instruments().len())
        .map(|i| factor(window.series(i, f)))
        .collect()
}

fn select_by_factor(factors: &[Vec<f64>], count: usize, order: &str, out: &mut SignalMatrix) {
    let largest = order == "largest";
    for d in 0..out.shape().0 {
        let chosen = rank_by_factor(factors.iter().map(|f| f[d]), count, largest);
        equal_weights(out.row_mut(d), &chosen);
    }
}

/// Mean of the recorded values among the last `n`, NaN when none is recorded.
fn trailing_mean(series: &[f64], n: usize) -> Vec<f64> {
    (0..series.len())
        .map(|t| {
            let from = (t + 1).saturating_sub(n);
            let (sum, count) = series[from..=t]
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            if count == 0 { f64::NAN } else { sum / count as f64 }
        })
        .collect()
}

fn passes(condition: &str, factor: f64, lower: f64, upper: f64) -> bool {
    match condition {
        "greater" => factor > lower,
        "less" => factor < upper,
        "between" => factor >= lower && factor <= upper,
        "not_between" => factor < lower || factor > upper,
        _ => true,
    }
}

/// Indices of the `count` best finite factors. Ties keep instrument order.
fn rank_by_factor(factors: impl Iterator<Item = f64>, count: usize, largest: bool) -> Vec<usize> {
    let mut scored: Vec<(usize, f64)> = factors
        .enumerate()
        .filter(|(_, f)| f.is_finite())
        .collect();
    scored.sort_by(|a, b| {
        let ord = if largest { b.1.total_cmp(&a.1) } else { a.1.total_cmp(&b.1) };
        ord.then(a.0.cmp(&b.0))
    });
    let mut chosen: Vec<usize> = scored.into_iter().take(count).map(|(i, _)| i).collect();
    chosen.sort_unstable();
    chosen
}

fn equal_weights(row: &mut [f64], chosen: &[usize]) {
    if chosen.is_empty() {
        return;
    }
    let w = 1.0 / chosen.len() as f64;
    for &i in chosen {
        row[i] = w;
    }
}
