//! Performance metrics computed from a finished backtest.
//!
//! Every ratio is `None` when it is undefined (empty curve, zero variance,
//! no drawdown) so that candidates without a score sort last instead of
//! carrying a fake zero.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::backtest::BacktestResult;
use super::error::QtsimError;
use super::portfolio::{EquityPoint, Trade};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Return deviations below this fraction of the mean return count as zero.
const RELATIVE_NOISE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metrics {
    pub total_return: Option<f64>,
    pub annualized_return: Option<f64>,
    /// Largest peak-to-trough loss as a positive fraction.
    pub max_drawdown: Option<f64>,
    /// Longest run of dates spent below a prior peak.
    pub max_drawdown_duration: Option<usize>,
    /// Annualized standard deviation of daily returns.
    pub volatility: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    /// Share of position-reducing trades that closed above their cost basis.
    pub win_rate: Option<f64>,
    /// Traded notional divided by average equity.
    pub turnover: Option<f64>,
    pub total_fees: f64,
    pub trade_count: usize,
}

impl Metrics {
    pub fn evaluate(result: &BacktestResult, risk_free_rate: f64) -> Self {
        let curve = &result.equity_curve;
        let mut metrics = Metrics {
            total_fees: result.total_fees,
            trade_count: result.trades.len(),
            win_rate: win_rate(&result.trades),
            ..Default::default()
        };
        let Some(last) = curve.last() else {
            return metrics;
        };
        let initial = result.initial_capital;
        if initial > 0.0 {
            let total = last.equity / initial - 1.0;
            metrics.total_return = Some(total);
            let years = curve.len() as f64 / TRADING_DAYS_PER_YEAR;
            metrics.annualized_return = Some(if 1.0 + total <= 0.0 {
                -1.0
            } else {
                (1.0 + total).powf(1.0 / years) - 1.0
            });
        }

        let (dd, duration) = compute_drawdown(curve);
        metrics.max_drawdown = Some(dd);
        metrics.max_drawdown_duration = Some(duration);

        let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
        let risk = compute_risk_adjusted(curve, daily_rf);
        metrics.volatility = risk.volatility;
        metrics.sharpe_ratio = risk.sharpe;
        metrics.sortino_ratio = risk.sortino;
        metrics.calmar_ratio = match metrics.annualized_return {
            Some(ann) if dd > 0.0 => Some(ann / dd),
            _ => None,
        };

        let avg_equity = curve.iter().map(|p| p.equity).sum::<f64>() / curve.len() as f64;
        if avg_equity > 0.0 {
            let traded: f64 = result.trades.iter().map(Trade::notional).sum();
            metrics.turnover = Some(traded / avg_equity);
        }
        metrics
    }

    pub fn score(&self, metric: ScoreMetric) -> Option<f64> {
        let value = match metric {
            ScoreMetric::TotalReturn => self.total_return,
            ScoreMetric::AnnualizedReturn => self.annualized_return,
            ScoreMetric::Sharpe => self.sharpe_ratio,
            ScoreMetric::Sortino => self.sortino_ratio,
            ScoreMetric::Calmar => self.calmar_ratio,
            ScoreMetric::NegMaxDrawdown => self.max_drawdown.map(|d| -d),
        };
        value.filter(|v| v.is_finite())
    }
}

/// Metric the optimizer maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScoreMetric {
    #[default]
    TotalReturn,
    AnnualizedReturn,
    Sharpe,
    Sortino,
    Calmar,
    /// Smaller drawdowns score higher.
    NegMaxDrawdown,
}

impl fmt::Display for ScoreMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScoreMetric::TotalReturn => "total_return",
            ScoreMetric::AnnualizedReturn => "annualized_return",
            ScoreMetric::Sharpe => "sharpe",
            ScoreMetric::Sortino => "sortino",
            ScoreMetric::Calmar => "calmar",
            ScoreMetric::NegMaxDrawdown => "max_drawdown",
        })
    }
}

impl FromStr for ScoreMetric {
    type Err = QtsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "total_return" | "return" | "fv" => Ok(ScoreMetric::TotalReturn),
            "annualized_return" | "annual_return" => Ok(ScoreMetric::AnnualizedReturn),
            "sharpe" => Ok(ScoreMetric::Sharpe),
            "sortino" => Ok(ScoreMetric::Sortino),
            "calmar" => Ok(ScoreMetric::Calmar),
            "max_drawdown" | "drawdown" => Ok(ScoreMetric::NegMaxDrawdown),
            other => Err(QtsimError::invalid_param(
                "metric",
                format!("unknown metric '{other}'"),
            )),
        }
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_duration = 0usize;
    let mut current_dd_duration = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_duration = 0;
        } else if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            max_dd = max_dd.max(dd);
            current_dd_duration += 1;
            max_dd_duration = max_dd_duration.max(current_dd_duration);
        }
    }

    (max_dd, max_dd_duration)
}

struct RiskAdjusted {
    volatility: Option<f64>,
    sharpe: Option<f64>,
    sortino: Option<f64>,
}

fn compute_risk_adjusted(equity_curve: &[EquityPoint], daily_rf: f64) -> RiskAdjusted {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let (prev, curr) = (w[0].equity, w[1].equity);
            if prev > 0.0 { (curr - prev) / prev } else { 0.0 }
        })
        .collect();

    if returns.is_empty() {
        return RiskAdjusted {
            volatility: None,
            sharpe: None,
            sortino: None,
        };
    }

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let excess_return = mean - daily_rf;
    let annualize = TRADING_DAYS_PER_YEAR.sqrt();

    let downside: f64 = returns
        .iter()
        .filter(|&&r| r < daily_rf)
        .map(|&r| (r - daily_rf).powi(2))
        .sum::<f64>()
        / n;
    let downside_stddev = downside.sqrt();

    // deviations this small next to the returns are rounding, not risk
    let noise = mean.abs().max(daily_rf.abs()) * RELATIVE_NOISE;
    let stddev = if stddev > noise { stddev } else { 0.0 };

    RiskAdjusted {
        volatility: Some(stddev * annualize),
        sharpe: (stddev > 0.0).then(|| excess_return / stddev * annualize),
        sortino: (downside_stddev > noise).then(|| excess_return / downside_stddev * annualize),
    }
}

/// Replay the trade log against an average-cost book.
fn win_rate(trades: &[Trade]) -> Option<f64> {
    // instrument -> (quantity, average cost)
    let mut book: HashMap<&str, (f64, f64)> = HashMap::new();
    let (mut closed, mut won) = (0usize, 0usize);
    for t in trades {
        let (qty, avg) = book.entry(t.instrument.as_str()).or_insert((0.0, 0.0));
        let reduces = *qty != 0.0 && qty.signum() != t.quantity.signum();
        if reduces {
            let closing = t.quantity.abs().min(qty.abs());
            let pnl = (t.price - *avg) * closing * qty.signum() - t.cost;
            closed += 1;
            if pnl > 0.0 {
                won += 1;
            }
            let remaining = *qty + t.quantity;
            if remaining.signum() != qty.signum() && remaining != 0.0 {
                // flipped through zero: the excess opens at this price
                *avg = t.price;
            }
            *qty = remaining;
        } else {
            let total = *qty + t.quantity;
            *avg = (*avg * qty.abs() + t.price * t.quantity.abs()) / total.abs();
            *qty = total;
        }
    }
    (closed > 0).then(|| won as f64 / closed as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn date(i: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64)
    }

    fn make_equity_curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| EquityPoint {
                date: date(i),
                equity: v,
            })
            .collect()
    }

    fn make_result(equity: &[f64], trades: Vec<Trade>) -> BacktestResult {
        BacktestResult {
            instruments: vec!["A".into()],
            holdings: vec![],
            equity_curve: make_equity_curve(equity),
            initial_capital: equity.first().copied().unwrap_or(100_000.0),
            total_fees: trades.iter().map(|t| t.cost).sum(),
            trades,
        }
    }

    fn make_trade(i: usize, quantity: f64, price: f64) -> Trade {
        Trade {
            date: date(i),
            instrument: "A".into(),
            quantity,
            price,
            cost: 0.0,
        }
    }

    #[test]
    fn empty_curve_has_no_metrics() {
        let m = Metrics::evaluate(&make_result(&[], vec![]), 0.0);
        assert_eq!(m.total_return, None);
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.max_drawdown, None);
        assert_eq!(m.score(ScoreMetric::TotalReturn), None);
    }

    #[test]
    fn flat_curve() {
        let m = Metrics::evaluate(&make_result(&[100.0; 30], vec![]), 0.0);
        assert_eq!(m.total_return, Some(0.0));
        assert_eq!(m.annualized_return, Some(0.0));
        assert_eq!(m.max_drawdown, Some(0.0));
        assert_eq!(m.volatility, Some(0.0));
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.sortino_ratio, None);
        assert_eq!(m.calmar_ratio, None);
        assert_eq!(m.win_rate, None);
    }

    #[test]
    fn total_return_both_directions() {
        let up = Metrics::evaluate(&make_result(&[100_000.0, 110_000.0], vec![]), 0.0);
        assert_relative_eq!(up.total_return.unwrap(), 0.10, epsilon = 1e-12);
        let down = Metrics::evaluate(&make_result(&[100_000.0, 90_000.0], vec![]), 0.0);
        assert_relative_eq!(down.total_return.unwrap(), -0.10, epsilon = 1e-12);
    }

    #[test]
    fn annualized_over_one_year() {
        let mut values = vec![100.0; 252];
        values[251] = 110.0;
        let m = Metrics::evaluate(&make_result(&values, vec![]), 0.0);
        assert_relative_eq!(m.annualized_return.unwrap(), 0.10, epsilon = 1e-9);
    }

    #[test]
    fn max_drawdown() {
        let curve = make_equity_curve(&[100.0, 110.0, 90.0, 95.0, 80.0, 100.0]);
        let (dd, _) = compute_drawdown(&curve);
        assert_relative_eq!(dd, (110.0 - 80.0) / 110.0, epsilon = 1e-12);
    }

    #[test]
    fn max_drawdown_duration() {
        let curve = make_equity_curve(&[100.0, 110.0, 100.0, 90.0, 85.0, 95.0]);
        let (_, duration) = compute_drawdown(&curve);
        assert_eq!(duration, 4);
    }

    #[test]
    fn steady_growth_has_positive_sharpe() {
        let values: Vec<f64> = (0..253)
            .map(|i| 100_000.0 * (1.0 + 0.001 * i as f64 + 0.002 * (i % 2) as f64))
            .collect();
        let m = Metrics::evaluate(&make_result(&values, vec![]), 0.0);
        assert!(m.sharpe_ratio.unwrap() > 0.0);
        assert!(m.calmar_ratio.unwrap() > 0.0);
    }

    #[test]
    fn constant_compounding_has_no_sharpe() {
        let mut values = vec![100_000.0];
        for _ in 0..120 {
            let last = values[values.len() - 1];
            values.push(last * 1.0007);
        }
        let m = Metrics::evaluate(&make_result(&values, vec![]), 0.0);
        assert_eq!(m.volatility, Some(0.0));
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.sortino_ratio, None);
        assert!(m.total_return.unwrap() > 0.0);
    }

    #[test]
    fn sortino_needs_downside() {
        let curve = make_equity_curve(&[100.0, 101.0, 100.5, 101.5, 100.0, 102.0]);
        let r = compute_risk_adjusted(&curve, 0.0);
        assert!(r.sharpe.unwrap().is_finite());
        assert!(r.sortino.unwrap().is_finite());
        let rising = make_equity_curve(&[100.0, 101.0, 103.0]);
        assert_eq!(compute_risk_adjusted(&rising, 0.0).sortino, None);
    }

    #[test]
    fn win_rate_from_average_cost() {
        let trades = vec![
            make_trade(0, 10.0, 10.0),
            make_trade(1, 10.0, 20.0),
            // average cost 15
            make_trade(2, -5.0, 16.0),
            make_trade(3, -15.0, 14.0),
        ];
        assert_eq!(win_rate(&trades), Some(0.5));
        assert_eq!(win_rate(&trades[..2]), None);
    }

    #[test]
    fn turnover_and_fees() {
        let mut trades = vec![make_trade(0, 10.0, 10.0), make_trade(1, -10.0, 10.0)];
        trades[0].cost = 1.0;
        let m = Metrics::evaluate(&make_result(&[100.0, 100.0], trades), 0.0);
        assert_relative_eq!(m.turnover.unwrap(), 2.0, epsilon = 1e-12);
        assert_eq!(m.total_fees, 1.0);
        assert_eq!(m.trade_count, 2);
    }

    #[test]
    fn score_selects_metric() {
        let m = Metrics {
            total_return: Some(0.2),
            max_drawdown: Some(0.1),
            sharpe_ratio: Some(f64::INFINITY),
            ..Default::default()
        };
        assert_eq!(m.score(ScoreMetric::TotalReturn), Some(0.2));
        assert_eq!(m.score(ScoreMetric::NegMaxDrawdown), Some(-0.1));
        assert_eq!(m.score(ScoreMetric::Sharpe), None);
        assert_eq!("calmar".parse::<ScoreMetric>().unwrap(), ScoreMetric::Calmar);
        assert!("luck".parse::<ScoreMetric>().is_err());
    }
}
