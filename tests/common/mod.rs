#![allow(dead_code)]

use chrono::NaiveDate;
use qtsim::domain::backtest::BacktestResult;
use qtsim::domain::error::QtsimError;
use qtsim::domain::history::{HistoryCube, HistoryCubeBuilder};
use qtsim::domain::metrics::Metrics;
use qtsim::domain::optimizer::OptimizationResult;
use qtsim::domain::parameter::ParameterSpace;
use qtsim::ports::data_port::{DataProvider, HistoryFragment, Observation};
use qtsim::ports::report_port::ResultSink;
use std::collections::HashMap;
use std::sync::Mutex;

pub fn date(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i as i64)
}

/// Closes for `days` dates following a slow sine around a drift.
pub fn wave(days: usize, base: f64, drift: f64) -> Vec<f64> {
    (0..days)
        .map(|i| base + 8.0 * (i as f64 / 7.0).sin() + drift * i as f64)
        .collect()
}

/// One `close` column per instrument, dated from [`date`].
pub fn close_cube(series: &[(&str, &[f64])]) -> HistoryCube {
    let mut b = HistoryCubeBuilder::new();
    for (name, closes) in series {
        b.instrument(name);
        for (i, c) in closes.iter().enumerate() {
            b.record(name, "close", date(i), *c);
        }
    }
    b.build().unwrap()
}

pub struct MockProvider {
    pub data: HashMap<(String, String), Vec<(NaiveDate, f64)>>,
    pub rate_limited: Option<u64>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            rate_limited: None,
        }
    }

    pub fn with_series(mut self, instrument: &str, field: &str, values: &[f64]) -> Self {
        let rows = values.iter().enumerate().map(|(i, v)| (date(i), *v)).collect();
        self.data.insert((instrument.to_string(), field.to_string()), rows);
        self
    }

    pub fn throttled(mut self, retry_after_secs: u64) -> Self {
        self.rate_limited = Some(retry_after_secs);
        self
    }
}

impl DataProvider for MockProvider {
    fn fetch(
        &self,
        data_id: &str,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoryFragment, QtsimError> {
        if let Some(retry_after_secs) = self.rate_limited {
            return Err(QtsimError::RateLimited { retry_after_secs });
        }
        let mut fragment = HistoryFragment {
            data_id: data_id.to_string(),
            ..Default::default()
        };
        for inst in instruments {
            match self.data.get(&(inst.clone(), data_id.to_string())) {
                Some(rows) => fragment.observations.extend(
                    rows.iter()
                        .filter(|(d, _)| *d >= start && *d <= end)
                        .map(|(d, v)| Observation {
                            instrument: inst.clone(),
                            date: *d,
                            value: *v,
                        }),
                ),
                None => fragment.missing.push(inst.clone()),
            }
        }
        Ok(fragment)
    }
}

/// Records what was published instead of writing it anywhere.
#[derive(Default)]
pub struct MemorySink {
    pub backtests: Mutex<Vec<(String, f64)>>,
    pub optimizations: Mutex<Vec<(usize, usize)>>,
}

impl ResultSink for MemorySink {
    fn publish_backtest(
        &self,
        label: &str,
        result: &BacktestResult,
        _metrics: &Metrics,
    ) -> Result<(), QtsimError> {
        self.backtests
            .lock()
            .unwrap()
            .push((label.to_string(), result.final_equity().unwrap_or_default()));
        Ok(())
    }

    fn publish_optimization(
        &self,
        result: &OptimizationResult,
        space: &ParameterSpace,
    ) -> Result<(), QtsimError> {
        self.optimizations
            .lock()
            .unwrap()
            .push((result.ranked.len(), space.len()));
        Ok(())
    }
}
