//! Simulation engine (date-by-date portfolio state machine).
//!
//! [`BacktestConfig`] holds every knob of one run. [`run_backtest`] windows
//! the history, asks the operator for rebalance rows and hands them to
//! [`simulate`], which marks the portfolio to market on every date and trades
//! toward the operator's weights on rebalance dates.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use super::error::QtsimError;
use super::execution::{
    affordable_quantity, buy_cost, calculate_fee, CostModel, LotSizes,
};
use super::history::{HistoryCube, HistoryView};
use super::operator::{Operator, OperatorOutput};
use super::portfolio::{EquityPoint, Holdings, Portfolio, Trade};

/// Quantities below this are treated as no trade.
const QTY_EPSILON: f64 = 1e-9;

/// What to do when buy orders need more cash than is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CashShortfallPolicy {
    /// Scale every buy order by the same factor so they fit.
    #[default]
    ScaleDown,
    /// Abort the run with [`QtsimError::InsufficientCash`].
    Fail,
}

impl FromStr for CashShortfallPolicy {
    type Err = QtsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scale_down" | "scale" => Ok(CashShortfallPolicy::ScaleDown),
            "fail" => Ok(CashShortfallPolicy::Fail),
            other => Err(QtsimError::invalid_param(
                "cash_policy",
                format!("'{other}' (expected scale_down or fail)"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RebalanceFrequency {
    #[default]
    Daily,
    /// First date of each ISO week.
    Weekly,
    /// First date of each calendar month.
    Monthly,
    /// Every n-th date, starting with the first.
    EveryN(usize),
}

impl RebalanceFrequency {
    /// Indices into `dates` at which the portfolio rebalances.
    pub fn schedule(&self, dates: &[NaiveDate]) -> Vec<usize> {
        match *self {
            RebalanceFrequency::Daily => (0..dates.len()).collect(),
            RebalanceFrequency::EveryN(n) => (0..dates.len()).step_by(n.max(1)).collect(),
            RebalanceFrequency::Weekly => first_of_period(dates, |d| {
                let w = d.iso_week();
                (w.year(), w.week())
            }),
            RebalanceFrequency::Monthly => first_of_period(dates, |d| (d.year(), d.month())),
        }
    }
}

fn first_of_period<K: PartialEq>(dates: &[NaiveDate], key: impl Fn(&NaiveDate) -> K) -> Vec<usize> {
    let mut rows = Vec::new();
    let mut prev: Option<K> = None;
    for (i, d) in dates.iter().enumerate() {
        let k = key(d);
        if prev.as_ref() != Some(&k) {
            rows.push(i);
        }
        prev = Some(k);
    }
    rows
}

impl FromStr for RebalanceFrequency {
    type Err = QtsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "d" | "daily" => return Ok(RebalanceFrequency::Daily),
            "w" | "weekly" => return Ok(RebalanceFrequency::Weekly),
            "m" | "monthly" => return Ok(RebalanceFrequency::Monthly),
            _ => {}
        }
        let n = s.strip_prefix("every:").unwrap_or(&s);
        match n.parse::<usize>() {
            Ok(n) if n > 0 => Ok(RebalanceFrequency::EveryN(n)),
            _ => Err(QtsimError::invalid_param(
                "rebalance",
                format!("'{s}' (expected daily, weekly, monthly or every:N)"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacktestConfig {
    /// First simulated date; defaults to the first cube date.
    pub start_date: Option<NaiveDate>,
    /// Last simulated date; defaults to the last cube date.
    pub end_date: Option<NaiveDate>,
    pub initial_capital: f64,
    pub costs: CostModel,
    pub cash_policy: CashShortfallPolicy,
    pub allow_short: bool,
    pub lots: LotSizes,
    pub rebalance: RebalanceFrequency,
    /// Field used for execution and mark-to-market.
    pub price_field: String,
    /// Annual rate used by the ratio metrics.
    pub risk_free_rate: f64,
    /// Weight added per unit of buy signal.
    pub signal_step: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            start_date: None,
            end_date: None,
            initial_capital: 100_000.0,
            costs: CostModel::default(),
            cash_policy: CashShortfallPolicy::default(),
            allow_short: false,
            lots: LotSizes::default(),
            rebalance: RebalanceFrequency::default(),
            price_field: "close".to_string(),
            risk_free_rate: 0.0,
            signal_step: 1.0,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), QtsimError> {
        let non_negative = [
            ("fee_rate", self.costs.fee_rate),
            ("fixed_fee", self.costs.fixed_fee),
            ("min_fee", self.costs.min_fee),
            ("lot_size", self.lots.default),
            ("signal_step", self.signal_step),
        ];
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(QtsimError::invalid_param(
                "initial_capital",
                "must be a positive number",
            ));
        }
        for (name, v) in non_negative {
            if !(v.is_finite() && v >= 0.0) {
                return Err(QtsimError::invalid_param(name, "must be a non-negative number"));
            }
        }
        if let (Some(s), Some(e)) = (self.start_date, self.end_date) {
            if s > e {
                return Err(QtsimError::invalid_param(
                    "start_date",
                    format!("{s} is after end_date {e}"),
                ));
            }
        }
        Ok(())
    }
}

/// Everything one simulation run produced.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacktestResult {
    pub instruments: Vec<String>,
    pub holdings: Vec<Holdings>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub initial_capital: f64,
    pub total_fees: f64,
}

impl BacktestResult {
    pub fn final_equity(&self) -> Option<f64> {
        self.equity_curve.last().map(|p| p.equity)
    }

    pub fn final_cash(&self) -> Option<f64> {
        self.holdings.last().map(|h| h.cash)
    }
}

/// Window the history for `operator`, compose its rebalance rows and simulate.
pub fn run_backtest(
    operator: &Operator,
    view: &HistoryView,
    config: &BacktestConfig,
) -> Result<BacktestResult, QtsimError> {
    config.validate()?;
    let cube = view.cube();
    let instruments: Vec<&str> = match operator.universe() {
        Some(universe) => universe.iter().map(String::as_str).collect(),
        None => cube.instruments().iter().map(String::as_str).collect(),
    };
    let mut fields: Vec<&str> = operator.required_fields();
    if !fields.contains(&config.price_field.as_str()) {
        fields.push(&config.price_field);
    }

    let (Some(first), Some(last)) = (cube.dates().first(), cube.dates().last()) else {
        return Err(QtsimError::breach("history cube has no dates"));
    };
    let start = config.start_date.unwrap_or(*first);
    let end = config.end_date.unwrap_or(*last);
    let window = view.window(&instruments, &fields, start, end)?;
    let rows = config.rebalance.schedule(window.dates());
    let output = operator.compose(&window, &rows)?;
    debug!(
        dates = window.dates().len(),
        instruments = instruments.len(),
        rebalances = rows.len(),
        "simulating"
    );
    simulate(cube, window.dates(), &output, config)
}

/// Step through `dates`, rebalancing on the dates carried by `output`.
///
/// Prices and tradability come from the raw `market` cube: a date on which
/// an instrument has no recorded price (or is flagged halted) defers its
/// order, which is retried every following date until it executes or a newer
/// rebalance replaces it. Equity uses the last known price.
pub fn simulate(
    market: &HistoryCube,
    dates: &[NaiveDate],
    output: &OperatorOutput,
    config: &BacktestConfig,
) -> Result<BacktestResult, QtsimError> {
    let reference = output
        .targets
        .as_ref()
        .or(output.deltas.as_ref())
        .ok_or_else(|| QtsimError::breach("operator output has neither targets nor deltas"))?;
    let instruments = reference.instruments().to_vec();
    let rebalance_dates = reference.dates();
    let price_field = market.require_field(&config.price_field)?;
    let market_idx = instruments
        .iter()
        .map(|name| market.require_instrument(name))
        .collect::<Result<Vec<_>, _>>()?;

    let n = instruments.len();
    let mut portfolio = Portfolio::new(config.initial_capital, n);
    let mut pending: Vec<Option<f64>> = vec![None; n];
    let mut holdings = Vec::with_capacity(dates.len());
    let mut equity_curve = Vec::with_capacity(dates.len());
    let mut trades = Vec::new();
    let mut next_row = 0;

    for &date in dates {
        let d = market
            .date_index(date)
            .ok_or_else(|| QtsimError::breach(format!("{date} is not on the market date axis")))?;
        let prices: Vec<Option<f64>> = market_idx
            .iter()
            .map(|&i| {
                if market.is_tradable(i, price_field, d) {
                    market.value(i, price_field, d)
                } else {
                    None
                }
            })
            .collect();
        for (k, p) in prices.iter().enumerate() {
            if let Some(p) = p {
                portfolio.last_prices[k] = *p;
            }
        }

        if rebalance_dates.get(next_row) == Some(&date) {
            for (k, w) in desired_weights(&portfolio, output, next_row, config)
                .into_iter()
                .enumerate()
            {
                if w.is_some() {
                    pending[k] = w;
                }
            }
            next_row += 1;
        }

        if pending.iter().any(Option::is_some) {
            let fills = execute(
                &mut portfolio,
                &mut pending,
                &prices,
                &instruments,
                date,
                config,
            )?;
            trades.extend(fills);
        }

        holdings.push(portfolio.snapshot(date));
        equity_curve.push(EquityPoint {
            date,
            equity: portfolio.total_equity(),
        });
    }

    Ok(BacktestResult {
        instruments,
        holdings,
        trades,
        equity_curve,
        initial_capital: config.initial_capital,
        total_fees: portfolio.total_fees,
    })
}

/// Weights requested at rebalance `row`: the target row if present, with
/// signal deltas applied on top. `None` leaves an instrument untouched.
fn desired_weights(
    portfolio: &Portfolio,
    output: &OperatorOutput,
    row: usize,
    config: &BacktestConfig,
) -> Vec<Option<f64>> {
    let n = portfolio.quantities.len();
    let floor = if config.allow_short { -1.0 } else { 0.0 };
    let mut desired: Vec<Option<f64>> = match &output.targets {
        Some(t) => t.row(row).iter().map(|w| Some(w.max(floor))).collect(),
        None => vec![None; n],
    };
    if let Some(deltas) = &output.deltas {
        let current = portfolio.weights();
        for (k, &delta) in deltas.row(row).iter().enumerate() {
            if delta == 0.0 {
                continue;
            }
            let base = desired[k].unwrap_or(current[k]);
            let w = if delta < 0.0 {
                base * (1.0 + delta)
            } else {
                base + delta * config.signal_step
            };
            desired[k] = Some(w.clamp(floor, 1.0));
        }
    }
    desired
}

/// Turn pending weights into fills: sells first so their proceeds fund
/// buys, then buys under the cash-shortfall policy.
fn execute(
    portfolio: &mut Portfolio,
    pending: &mut [Option<f64>],
    prices: &[Option<f64>],
    instruments: &[String],
    date: NaiveDate,
    config: &BacktestConfig,
) -> Result<Vec<Trade>, QtsimError> {
    let costs = &config.costs;
    let lots = &config.lots;
    let equity = portfolio.total_equity();

    let mut orders: Vec<(usize, f64, f64)> = Vec::new();
    for k in 0..pending.len() {
        let (Some(weight), Some(price)) = (pending[k], prices[k]) else {
            continue;
        };
        pending[k] = None;
        let target = weight * equity / price;
        let quantity = lots.truncate(&instruments[k], target - portfolio.quantities[k]);
        if quantity.abs() > QTY_EPSILON {
            orders.push((k, quantity, price));
        }
    }

    let mut fills = Vec::new();
    for &(k, quantity, price) in orders.iter().filter(|o| o.1 < 0.0) {
        let fill = costs.slippage.fill_price(price, quantity);
        let fee = calculate_fee(-quantity * fill, costs);
        if portfolio.cash - quantity * fill - fee < 0.0 {
            continue;
        }
        portfolio.apply_fill(k, quantity, fill, fee);
        fills.push(trade(date, &instruments[k], quantity, fill, fee));
    }

    let mut buys: Vec<(usize, f64, f64)> = orders
        .iter()
        .filter(|o| o.1 > 0.0)
        .map(|&(k, q, price)| (k, q, costs.slippage.fill_price(price, q)))
        .collect();
    let required: f64 = buys.iter().map(|&(_, q, fill)| buy_cost(q, fill, costs)).sum();
    if required > portfolio.cash {
        match config.cash_policy {
            CashShortfallPolicy::Fail => {
                return Err(QtsimError::InsufficientCash {
                    date,
                    required,
                    available: portfolio.cash,
                });
            }
            CashShortfallPolicy::ScaleDown => {
                let factor = (portfolio.cash / required).max(0.0);
                for (k, q, _) in buys.iter_mut() {
                    *q = lots.truncate(&instruments[*k], *q * factor);
                }
            }
        }
    }

    for (k, mut quantity, fill) in buys {
        let name = &instruments[k];
        if buy_cost(quantity, fill, costs) > portfolio.cash {
            let affordable = affordable_quantity(portfolio.cash, fill, costs);
            quantity = lots.truncate(name, quantity.min(affordable));
        }
        let mut guard = 0;
        while quantity > QTY_EPSILON && buy_cost(quantity, fill, costs) > portfolio.cash && guard < 64 {
            quantity = lots.step_down(name, quantity);
            guard += 1;
        }
        if quantity <= QTY_EPSILON || buy_cost(quantity, fill, costs) > portfolio.cash {
            continue;
        }
        let fee = calculate_fee(quantity * fill, costs);
        portfolio.apply_fill(k, quantity, fill, fee);
        fills.push(trade(date, name, quantity, fill, fee));
    }
    Ok(fills)
}

fn trade(date: NaiveDate, instrument: &str, quantity: f64, price: f64, cost: f64) -> Trade {
    Trade {
        date,
        instrument: instrument.to_string(),
        quantity,
        price,
        cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::SlippageModel;
    use crate::domain::history::{HistoryCubeBuilder, HALTED_FIELD};
    use crate::domain::signal::SignalMatrix;

    fn d(i: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64)
    }

    fn market(series: &[(&str, &[f64])]) -> HistoryCube {
        let mut b = HistoryCubeBuilder::new();
        for (name, closes) in series {
            for (i, c) in closes.iter().enumerate() {
                b.record(name, "close", d(i), *c);
            }
        }
        b.build().unwrap()
    }

    fn targets(rows: &[usize], instruments: &[&str], values: Vec<f64>) -> OperatorOutput {
        OperatorOutput {
            targets: Some(
                SignalMatrix::from_rows(
                    rows.iter().map(|&r| d(r)).collect(),
                    instruments.iter().map(|s| s.to_string()).collect(),
                    values,
                )
                .unwrap(),
            ),
            deltas: None,
        }
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            initial_capital: 10_000.0,
            ..Default::default()
        }
    }

    #[test]
    fn flat_price_full_weight_buys_once() {
        let m = market(&[("A", &[100.0; 10])]);
        let dates: Vec<_> = (0..10).map(d).collect();
        let rows: Vec<usize> = (0..10).collect();
        let out = targets(&rows, &["A"], vec![1.0; 10]);
        let r = simulate(&m, &dates, &out, &config()).unwrap();
        assert_eq!(r.trades.len(), 1);
        assert_eq!(r.trades[0].quantity, 100.0);
        assert!(r.equity_curve.iter().all(|p| p.equity == 10_000.0));
        assert_eq!(r.final_cash(), Some(0.0));
    }

    #[test]
    fn fees_and_slippage_reduce_equity() {
        let m = market(&[("A", &[100.0; 3])]);
        let dates: Vec<_> = (0..3).map(d).collect();
        let cfg = BacktestConfig {
            costs: CostModel {
                fee_rate: 0.001,
                fixed_fee: 0.0,
                min_fee: 0.0,
                slippage: SlippageModel::Proportional(0.01),
            },
            ..config()
        };
        let r = simulate(&m, &dates, &targets(&[0], &["A"], vec![1.0]), &cfg).unwrap();
        let t = &r.trades[0];
        assert_eq!(t.price, 101.0);
        // 10_000 / (101 * 1.001) = 98.9..., truncated to 98 shares
        assert_eq!(t.quantity, 98.0);
        assert!((t.cost - 98.0 * 101.0 * 0.001).abs() < 1e-9);
        assert!(r.final_cash().unwrap() >= 0.0);
        assert!(r.final_equity().unwrap() < 10_000.0);
        assert!((r.total_fees - t.cost).abs() < 1e-12);
    }

    #[test]
    fn sells_fund_buys_on_rotation() {
        let m = market(&[("A", &[50.0, 50.0]), ("B", &[25.0, 25.0])]);
        let dates: Vec<_> = (0..2).map(d).collect();
        let out = targets(&[0, 1], &["A", "B"], vec![1.0, 0.0, 0.0, 1.0]);
        let r = simulate(&m, &dates, &out, &config()).unwrap();
        assert_eq!(r.trades.len(), 3);
        assert_eq!(r.trades[1].instrument, "A");
        assert_eq!(r.trades[1].quantity, -200.0);
        assert_eq!(r.trades[2].instrument, "B");
        assert_eq!(r.trades[2].quantity, 400.0);
        assert_eq!(r.holdings[1].quantities, vec![0.0, 400.0]);
    }

    #[test]
    fn shortfall_scales_down_or_fails() {
        let m = market(&[("A", &[10.0]), ("B", &[10.0])]);
        let dates = vec![d(0)];
        let out = targets(&[0], &["A", "B"], vec![1.0, 1.0]);
        let scaled = simulate(&m, &dates, &out, &config()).unwrap();
        let bought: Vec<f64> = scaled.trades.iter().map(|t| t.quantity).collect();
        assert_eq!(bought, vec![500.0, 500.0]);
        assert!(scaled.final_cash().unwrap() >= 0.0);

        let fail = BacktestConfig {
            cash_policy: CashShortfallPolicy::Fail,
            ..config()
        };
        let err = simulate(&m, &dates, &out, &fail).unwrap_err();
        assert!(matches!(err, QtsimError::InsufficientCash { .. }));
    }

    #[test]
    fn halted_instrument_order_waits() {
        let mut b = HistoryCubeBuilder::new();
        for i in 0..3 {
            b.record("A", "close", d(i), 10.0);
        }
        b.record("A", HALTED_FIELD, d(0), 1.0);
        let m = b.build().unwrap();
        let dates: Vec<_> = (0..3).map(d).collect();
        let r = simulate(&m, &dates, &targets(&[0], &["A"], vec![1.0]), &config()).unwrap();
        assert_eq!(r.trades.len(), 1);
        assert_eq!(r.trades[0].date, d(1));
        assert_eq!(r.holdings[0].quantities, vec![0.0]);
    }

    #[test]
    fn newer_rebalance_supersedes_pending_order() {
        let m = market(&[("A", &[f64::NAN, f64::NAN, 10.0])]);
        let dates: Vec<_> = (0..3).map(d).collect();
        let out = targets(&[0, 1], &["A"], vec![1.0, 0.5]);
        let r = simulate(&m, &dates, &out, &config()).unwrap();
        assert_eq!(r.trades.len(), 1);
        assert_eq!(r.trades[0].quantity, 500.0);
    }

    #[test]
    fn missing_price_marks_at_last_known() {
        let m = market(&[("A", &[10.0, f64::NAN, 12.0])]);
        let dates: Vec<_> = (0..3).map(d).collect();
        let r = simulate(&m, &dates, &targets(&[0], &["A"], vec![1.0]), &config()).unwrap();
        let eq: Vec<f64> = r.equity_curve.iter().map(|p| p.equity).collect();
        assert_eq!(eq, vec![10_000.0, 10_000.0, 12_000.0]);
    }

    #[test]
    fn lot_size_truncates_orders() {
        let m = market(&[("A", &[30.0])]);
        let cfg = BacktestConfig {
            lots: LotSizes {
                default: 100.0,
                ..Default::default()
            },
            ..config()
        };
        let r = simulate(&m, &[d(0)], &targets(&[0], &["A"], vec![1.0]), &cfg).unwrap();
        // 333.3 shares wanted, 300 is the largest whole lot
        assert_eq!(r.trades[0].quantity, 300.0);
        assert!((r.final_cash().unwrap() - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn sell_signal_cuts_position() {
        let m = market(&[("A", &[10.0, 10.0])]);
        let dates: Vec<_> = (0..2).map(d).collect();
        let names = vec!["A".to_string()];
        let out = OperatorOutput {
            targets: None,
            deltas: Some(SignalMatrix::from_rows(dates.clone(), names, vec![1.0, -0.5]).unwrap()),
        };
        let r = simulate(&m, &dates, &out, &config()).unwrap();
        assert_eq!(r.holdings[0].quantities, vec![1_000.0]);
        assert_eq!(r.holdings[1].quantities, vec![500.0]);
    }

    #[test]
    fn schedules() {
        let dates: Vec<NaiveDate> = (0..40).map(d).collect();
        assert_eq!(RebalanceFrequency::Daily.schedule(&dates).len(), 40);
        assert_eq!(RebalanceFrequency::EveryN(10).schedule(&dates), vec![0, 10, 20, 30]);
        // 2024-01-01 is a Monday; Feb starts at index 31
        assert_eq!(RebalanceFrequency::Monthly.schedule(&dates), vec![0, 31]);
        assert_eq!(
            RebalanceFrequency::Weekly.schedule(&dates),
            vec![0, 7, 14, 21, 28, 35]
        );
    }

    #[test]
    fn parse_policies() {
        assert_eq!("monthly".parse::<RebalanceFrequency>().unwrap(), RebalanceFrequency::Monthly);
        assert_eq!("every:5".parse::<RebalanceFrequency>().unwrap(), RebalanceFrequency::EveryN(5));
        assert_eq!("3".parse::<RebalanceFrequency>().unwrap(), RebalanceFrequency::EveryN(3));
        assert!("every:0".parse::<RebalanceFrequency>().is_err());
        assert_eq!("fail".parse::<CashShortfallPolicy>().unwrap(), CashShortfallPolicy::Fail);
        assert!("maybe".parse::<CashShortfallPolicy>().is_err());
    }

    #[test]
    fn config_validation() {
        assert!(BacktestConfig::default().validate().is_ok());
        let bad = BacktestConfig {
            initial_capital: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = BacktestConfig {
            start_date: Some(d(5)),
            end_date: Some(d(1)),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
