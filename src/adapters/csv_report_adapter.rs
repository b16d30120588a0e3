//! CSV result sink.
//!
//! A backtest published under `label` becomes `label_equity.csv`,
//! `label_holdings.csv`, `label_trades.csv`, `label_monthly.csv` and
//! `label_metrics.csv`. An optimization becomes `optimization.csv` plus
//! `optimization_failures.csv` when any candidate failed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Datelike;

use crate::domain::backtest::BacktestResult;
use crate::domain::error::QtsimError;
use crate::domain::metrics::Metrics;
use crate::domain::optimizer::OptimizationResult;
use crate::domain::parameter::ParameterSpace;
use crate::domain::portfolio::EquityPoint;
use crate::ports::report_port::ResultSink;

pub struct CsvResultSink {
    output_dir: PathBuf,
}

impl CsvResultSink {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    fn writer(&self, name: &str) -> Result<csv::Writer<fs::File>, QtsimError> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(name);
        csv::Writer::from_path(&path).map_err(|e| csv_error(&path, e))
    }
}

fn csv_error(path: &Path, e: csv::Error) -> QtsimError {
    QtsimError::Io(std::io::Error::other(format!("{}: {e}", path.display())))
}

fn write_rows(
    mut w: csv::Writer<fs::File>,
    header: &[String],
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<(), QtsimError> {
    let wrap = |e: csv::Error| QtsimError::Io(std::io::Error::other(e.to_string()));
    w.write_record(header).map_err(wrap)?;
    for row in rows {
        w.write_record(&row).map_err(wrap)?;
    }
    w.flush()?;
    Ok(())
}

fn opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_default()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Compounded return per calendar month, keyed by (year, month).
fn compute_monthly_returns(equity_curve: &[EquityPoint]) -> BTreeMap<(i32, u32), f64> {
    let mut monthly: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for window in equity_curve.windows(2) {
        let (prev, curr) = (&window[0], &window[1]);
        let r = if prev.equity > 0.0 {
            (curr.equity - prev.equity) / prev.equity
        } else {
            0.0
        };
        let growth = monthly.entry((curr.date.year(), curr.date.month())).or_insert(1.0);
        *growth *= 1.0 + r;
    }
    monthly.into_iter().map(|(k, g)| (k, g - 1.0)).collect()
}

fn metric_rows(m: &Metrics) -> Vec<Vec<String>> {
    let rows: [(&str, String); 12] = [
        ("total_return", opt(m.total_return)),
        ("annualized_return", opt(m.annualized_return)),
        ("max_drawdown", opt(m.max_drawdown)),
        (
            "max_drawdown_duration",
            m.max_drawdown_duration.map(|d| d.to_string()).unwrap_or_default(),
        ),
        ("volatility", opt(m.volatility)),
        ("sharpe_ratio", opt(m.sharpe_ratio)),
        ("sortino_ratio", opt(m.sortino_ratio)),
        ("calmar_ratio", opt(m.calmar_ratio)),
        ("win_rate", opt(m.win_rate)),
        ("turnover", opt(m.turnover)),
        ("total_fees", format!("{:.2}", m.total_fees)),
        ("trade_count", m.trade_count.to_string()),
    ];
    rows.into_iter().map(|(k, v)| vec![k.to_string(), v]).collect()
}

impl ResultSink for CsvResultSink {
    fn publish_backtest(
        &self,
        label: &str,
        result: &BacktestResult,
        metrics: &Metrics,
    ) -> Result<(), QtsimError> {
        write_rows(
            self.writer(&format!("{label}_equity.csv"))?,
            &strings(&["date", "equity"]),
            result
                .equity_curve
                .iter()
                .map(|p| vec![p.date.to_string(), format!("{:.4}", p.equity)]),
        )?;

        let mut header = strings(&["date", "cash"]);
        header.extend(result.instruments.iter().cloned());
        write_rows(
            self.writer(&format!("{label}_holdings.csv"))?,
            &header,
            result.holdings.iter().map(|h| {
                let mut row = vec![h.date.to_string(), format!("{:.4}", h.cash)];
                row.extend(h.quantities.iter().map(|q| q.to_string()));
                row
            }),
        )?;

        write_rows(
            self.writer(&format!("{label}_trades.csv"))?,
            &strings(&["date", "instrument", "quantity", "price", "cost"]),
            result.trades.iter().map(|t| {
                vec![
                    t.date.to_string(),
                    t.instrument.clone(),
                    t.quantity.to_string(),
                    format!("{:.4}", t.price),
                    format!("{:.4}", t.cost),
                ]
            }),
        )?;

        write_rows(
            self.writer(&format!("{label}_monthly.csv"))?,
            &strings(&["year", "month", "return"]),
            compute_monthly_returns(&result.equity_curve)
                .into_iter()
                .map(|((y, m), r)| vec![y.to_string(), m.to_string(), format!("{r:.6}")]),
        )?;

        write_rows(
            self.writer(&format!("{label}_metrics.csv"))?,
            &strings(&["metric", "value"]),
            metric_rows(metrics),
        )
    }

    fn publish_optimization(
        &self,
        result: &OptimizationResult,
        space: &ParameterSpace,
    ) -> Result<(), QtsimError> {
        let mut header = strings(&["rank", "ordinal"]);
        header.extend(space.dims().iter().map(|d| d.name.clone()));
        header.extend(strings(&[
            "score",
            "total_return",
            "sharpe_ratio",
            "max_drawdown",
            "turnover",
            "final_equity",
        ]));
        write_rows(
            self.writer("optimization.csv")?,
            &header,
            result.ranked.iter().enumerate().map(|(rank, c)| {
                let mut row = vec![(rank + 1).to_string(), c.ordinal.to_string()];
                row.extend(c.params.values().iter().map(|v| v.to_string()));
                row.extend([
                    opt(c.score),
                    opt(c.metrics.total_return),
                    opt(c.metrics.sharpe_ratio),
                    opt(c.metrics.max_drawdown),
                    opt(c.metrics.turnover),
                    opt(c.result.final_equity()),
                ]);
                row
            }),
        )?;

        if !result.failures.is_empty() {
            write_rows(
                self.writer("optimization_failures.csv")?,
                &strings(&["ordinal", "params", "error"]),
                result
                    .failures
                    .iter()
                    .map(|f| vec![f.ordinal.to_string(), f.params.to_string(), f.error.clone()]),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::optimizer::{Candidate, FailedCandidate};
    use crate::domain::parameter::{ParamDim, ParamValue, ParameterVector};
    use crate::domain::portfolio::{Holdings, Trade};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn result() -> BacktestResult {
        BacktestResult {
            instruments: vec!["A".into(), "B".into()],
            holdings: vec![Holdings {
                date: d(1, 2),
                quantities: vec![10.0, 0.0],
                cash: 0.0,
            }],
            trades: vec![Trade {
                date: d(1, 2),
                instrument: "A".into(),
                quantity: 10.0,
                price: 10.0,
                cost: 0.5,
            }],
            equity_curve: vec![
                EquityPoint { date: d(1, 2), equity: 100.0 },
                EquityPoint { date: d(1, 31), equity: 110.0 },
                EquityPoint { date: d(2, 1), equity: 99.0 },
            ],
            initial_capital: 100.0,
            total_fees: 0.5,
        }
    }

    #[test]
    fn monthly_returns_compound() {
        let monthly = compute_monthly_returns(&result().equity_curve);
        assert!((monthly[&(2024, 1)] - 0.10).abs() < 1e-12);
        assert!((monthly[&(2024, 2)] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn backtest_files_written() {
        let dir = TempDir::new().unwrap();
        let sink = CsvResultSink::new(dir.path().join("out"));
        sink.publish_backtest("run", &result(), &Metrics::default()).unwrap();
        let holdings = fs::read_to_string(dir.path().join("out/run_holdings.csv")).unwrap();
        assert_eq!(holdings.lines().next(), Some("date,cash,A,B"));
        let trades = fs::read_to_string(dir.path().join("out/run_trades.csv")).unwrap();
        assert_eq!(trades.lines().count(), 2);
        let metrics = fs::read_to_string(dir.path().join("out/run_metrics.csv")).unwrap();
        assert!(metrics.lines().any(|l| l == "sharpe_ratio,"));
    }

    #[test]
    fn optimization_table_has_param_columns() {
        let dir = TempDir::new().unwrap();
        let sink = CsvResultSink::new(dir.path().to_path_buf());
        let space = ParameterSpace::new(vec![ParamDim::integer("timing0.macd.s", 2, 10)]);
        let params = ParameterVector::new(vec![ParamValue::Int(5)]);
        let opt_result = OptimizationResult {
            ranked: vec![Candidate {
                params: params.clone(),
                score: Some(0.1),
                metrics: Metrics::default(),
                result: result(),
                ordinal: 0,
            }],
            failures: vec![FailedCandidate {
                params,
                ordinal: 1,
                error: "boom".into(),
            }],
            evaluated: 2,
            cancelled: false,
        };
        sink.publish_optimization(&opt_result, &space).unwrap();
        let table = fs::read_to_string(dir.path().join("optimization.csv")).unwrap();
        let mut lines = table.lines();
        assert_eq!(
            lines.next().unwrap(),
            "rank,ordinal,timing0.macd.s,score,total_return,sharpe_ratio,max_drawdown,turnover,final_equity"
        );
        assert!(lines.next().unwrap().starts_with("1,0,5,0.100000,"));
        assert!(dir.path().join("optimization_failures.csv").exists());
    }
}
