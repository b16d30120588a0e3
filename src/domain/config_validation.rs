//! Configuration validation and assembly.
//!
//! Reads the `[backtest]`, `[operator]`, `[optimize]` and `[data]` sections
//! through a [`ConfigPort`], rejects bad values with the offending section
//! and key, and builds the typed configuration the engine runs on.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::domain::backtest::{BacktestConfig, CashShortfallPolicy, RebalanceFrequency};
use crate::domain::error::QtsimError;
use crate::domain::execution::{CostModel, LotSizes, SlippageModel};
use crate::domain::history::FillPolicy;
use crate::domain::metrics::ScoreMetric;
use crate::domain::operator::{Combination, Operator};
use crate::domain::optimizer::{Search, SearchConfig};
use crate::domain::parameter::{ParamDim, ParamKind, ParameterSpace};
use crate::domain::registry::StrategyRegistry;
use crate::domain::strategy::Strategy;
use crate::ports::config_port::ConfigPort;

const BACKTEST: &str = "backtest";
const OPERATOR: &str = "operator";
const OPTIMIZE: &str = "optimize";
const DATA: &str = "data";

/// What to load before running: where from, which instruments, how to fill gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub source: Option<String>,
    pub instruments: Vec<String>,
    pub fill: FillPolicy,
}

pub fn backtest_config(config: &dyn ConfigPort) -> Result<BacktestConfig, QtsimError> {
    let defaults = BacktestConfig::default();

    let initial_capital = number(config, BACKTEST, "initial_capital", defaults.initial_capital)?;
    if initial_capital <= 0.0 {
        return Err(invalid(BACKTEST, "initial_capital", "initial_capital must be positive"));
    }
    let fee_rate = non_negative(config, BACKTEST, "fee_rate")?;
    let fixed_fee = non_negative(config, BACKTEST, "fixed_fee")?;
    let min_fee = non_negative(config, BACKTEST, "min_fee")?;
    let slippage = slippage(config)?;

    let risk_free_rate = number(config, BACKTEST, "risk_free_rate", 0.0)?;
    if !(0.0..1.0).contains(&risk_free_rate) {
        return Err(invalid(BACKTEST, "risk_free_rate", "risk_free_rate must be between 0 and 1"));
    }

    let start_date = date(config, BACKTEST, "start_date")?;
    let end_date = date(config, BACKTEST, "end_date")?;
    if let (Some(s), Some(e)) = (start_date, end_date) {
        if s > e {
            return Err(invalid(BACKTEST, "start_date", "start_date must not be after end_date"));
        }
    }

    let lot = number(config, BACKTEST, "lot_size", 1.0)?;
    if lot <= 0.0 {
        return Err(invalid(BACKTEST, "lot_size", "lot_size must be positive"));
    }
    let lots = LotSizes {
        default: lot,
        overrides: lot_overrides(config)?,
        allow_fractional: flag(config, BACKTEST, "allow_fractional", false)?,
    };

    let signal_step = number(config, BACKTEST, "signal_step", defaults.signal_step)?;
    if signal_step < 0.0 {
        return Err(invalid(BACKTEST, "signal_step", "signal_step must be non-negative"));
    }

    Ok(BacktestConfig {
        start_date,
        end_date,
        initial_capital,
        costs: CostModel {
            fee_rate,
            fixed_fee,
            min_fee,
            slippage,
        },
        cash_policy: parsed(config, BACKTEST, "cash_policy", CashShortfallPolicy::default())?,
        allow_short: flag(config, BACKTEST, "allow_short", false)?,
        lots,
        rebalance: parsed(config, BACKTEST, "rebalance", RebalanceFrequency::default())?,
        price_field: text(config, BACKTEST, "price_field").unwrap_or(defaults.price_field),
        risk_free_rate,
        signal_step,
    })
}

/// Build the operator from `[operator]`.
///
/// Each role key holds `;`-separated strategy specs such as
/// `macd(12, 26, 9); dma`; a bare identifier takes default parameters.
/// `<role>_weights` switches the role to fixed combination weights.
pub fn operator(config: &dyn ConfigPort, registry: &StrategyRegistry) -> Result<Operator, QtsimError> {
    let mut op = Operator::new();
    for role in ["selecting", "timing", "signals"] {
        let Some(specs) = text(config, OPERATOR, role) else {
            continue;
        };
        let strategies = specs
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|spec| strategy(registry, spec))
            .collect::<Result<Vec<_>, _>>()?;
        let weights_key = format!("{role}_weights");
        let combination = match text(config, OPERATOR, &weights_key) {
            Some(w) => Combination::Fixed(number_list(&w, OPERATOR, &weights_key)?),
            None => Combination::EqualWeight,
        };
        op = match role {
            "selecting" => op.with_selecting(strategies, combination),
            "timing" => op.with_timing(strategies, combination),
            _ => op.with_signals(strategies, combination),
        };
    }
    if text(config, OPERATOR, "universe").is_some() {
        op = op.with_universe(config.get_list(OPERATOR, "universe"));
    }
    op = op.with_leverage(flag(config, OPERATOR, "allow_leverage", false)?);
    op.validate()?;
    Ok(op)
}

/// Parse `id` or `id(p1, p2, ...)`.
pub fn strategy(registry: &StrategyRegistry, spec: &str) -> Result<Strategy, QtsimError> {
    let spec = spec.trim();
    match spec.split_once('(') {
        Some((id, rest)) => {
            let args = rest.trim_end().strip_suffix(')').ok_or_else(|| {
                invalid(OPERATOR, id.trim(), format!("unbalanced parentheses in '{spec}'"))
            })?;
            let params = registry.default_space(id)?.parse_vector(args)?;
            registry.instantiate(id, params)
        }
        None => registry.lookup(spec),
    }
}

pub fn search_config(config: &dyn ConfigPort) -> Result<SearchConfig, QtsimError> {
    let defaults = SearchConfig::default();
    let algorithm = text(config, OPTIMIZE, "algorithm").unwrap_or_else(|| "grid".to_string());
    let algorithm = match algorithm.trim().to_ascii_lowercase().as_str() {
        "grid" => Search::Grid {
            continuous_steps: count(config, "continuous_steps", 5)?,
        },
        "random" => Search::Random {
            samples: count(config, "samples", 100)?,
        },
        "genetic" => Search::Genetic {
            population: count(config, "population", 20)?,
            generations: count(config, "generations", 10)?,
            crossover_rate: number(config, OPTIMIZE, "crossover_rate", 0.8)?,
            mutation_rate: number(config, OPTIMIZE, "mutation_rate", 0.1)?,
            elite: count(config, "elite", 2)?,
        },
        "annealing" => Search::Annealing {
            chains: count(config, "chains", 4)?,
            iterations: count(config, "iterations", 50)?,
            initial_temperature: number(config, OPTIMIZE, "initial_temperature", 1.0)?,
            cooling: number(config, OPTIMIZE, "cooling", 0.95)?,
        },
        other => {
            return Err(invalid(
                OPTIMIZE,
                "algorithm",
                format!("unknown algorithm '{other}' (expected grid, random, genetic or annealing)"),
            ));
        }
    };
    let search = SearchConfig {
        algorithm,
        seed: count(config, "seed", 0)? as u64,
        workers: count(config, "workers", defaults.workers)?,
        metric: parsed(config, OPTIMIZE, "metric", ScoreMetric::default())?,
    };
    search.validate().map_err(|e| match e {
        QtsimError::InvalidParameter { name, reason } => QtsimError::ConfigInvalid {
            section: OPTIMIZE.to_string(),
            key: name,
            reason,
        },
        other => other,
    })?;
    Ok(search)
}

/// The operator's parameter space, narrowed by `[optimize]` keys named after
/// its dimensions: `timing0.macd.s = 5..20` for numeric dimensions,
/// `selecting0.select_last_close.order = largest` for categorical ones.
/// A narrowed dimension must stay inside the strategy's own bounds.
pub fn search_space(config: &dyn ConfigPort, operator: &Operator) -> Result<ParameterSpace, QtsimError> {
    let dims = operator
        .parameter_space()
        .dims()
        .iter()
        .map(|dim| {
            let Some(raw) = text(config, OPTIMIZE, &dim.name) else {
                return Ok(dim.clone());
            };
            let outside = || invalid(OPTIMIZE, &dim.name, format!("'{raw}' is outside the strategy's range"));
            let kind = match &dim.kind {
                ParamKind::Integer { min, max } => {
                    let (lo, hi) = bounds(&raw, OPTIMIZE, &dim.name)?;
                    let (lo, hi) = (lo.round() as i64, hi.round() as i64);
                    if lo < *min || hi > *max {
                        return Err(outside());
                    }
                    ParamKind::Integer { min: lo, max: hi }
                }
                ParamKind::Continuous { min, max } => {
                    let (lo, hi) = bounds(&raw, OPTIMIZE, &dim.name)?;
                    if lo < *min || hi > *max {
                        return Err(outside());
                    }
                    ParamKind::Continuous { min: lo, max: hi }
                }
                ParamKind::Categorical(labels) => {
                    let chosen = list(&raw);
                    if chosen.is_empty() || chosen.iter().any(|c| !labels.contains(c)) {
                        return Err(outside());
                    }
                    ParamKind::Categorical(chosen)
                }
            };
            Ok(ParamDim {
                name: dim.name.clone(),
                kind,
            })
        })
        .collect::<Result<Vec<_>, QtsimError>>()?;
    Ok(ParameterSpace::new(dims))
}

/// `lo..hi`, or a single value for a fixed dimension.
fn bounds(raw: &str, section: &str, key: &str) -> Result<(f64, f64), QtsimError> {
    let parse = |s: &str| {
        s.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(section, key, format!("'{raw}' is not a range like 5..20")))
    };
    let (lo, hi) = match raw.split_once("..") {
        Some((lo, hi)) => (parse(lo)?, parse(hi)?),
        None => {
            let v = parse(raw)?;
            (v, v)
        }
    };
    if lo > hi {
        return Err(invalid(section, key, format!("empty range '{raw}'")));
    }
    Ok((lo, hi))
}

pub fn data_request(config: &dyn ConfigPort) -> Result<DataRequest, QtsimError> {
    let fill = match text(config, DATA, "fill").as_deref().map(str::to_ascii_lowercase) {
        None => FillPolicy::None,
        Some(f) => match f.as_str() {
            "none" | "strict" => FillPolicy::None,
            "ffill" | "forward" | "forward_fill" => FillPolicy::ForwardFill,
            "zero" => FillPolicy::Zero,
            "novalue" | "nan" | "keep" => FillPolicy::NoValue,
            other => {
                return Err(invalid(DATA, "fill", format!("unknown fill policy '{other}'")));
            }
        },
    };
    let instruments = config.get_list(DATA, "instruments");
    if instruments.is_empty() {
        return Err(QtsimError::ConfigMissing {
            section: DATA.to_string(),
            key: "instruments".to_string(),
        });
    }
    Ok(DataRequest {
        source: text(config, DATA, "path"),
        instruments,
        fill,
    })
}

fn slippage(config: &dyn ConfigPort) -> Result<SlippageModel, QtsimError> {
    let amount = non_negative(config, BACKTEST, "slippage_amount")?;
    match text(config, BACKTEST, "slippage").as_deref().map(str::to_ascii_lowercase) {
        None => Ok(SlippageModel::None),
        Some(kind) => match kind.as_str() {
            "none" => Ok(SlippageModel::None),
            "proportional" | "pct" => Ok(SlippageModel::Proportional(amount)),
            "fixed" | "per_unit" => Ok(SlippageModel::FixedPerUnit(amount)),
            other => Err(invalid(
                BACKTEST,
                "slippage",
                format!("unknown slippage model '{other}'"),
            )),
        },
    }
}

/// `lot_overrides = A:100, B:10`
fn lot_overrides(config: &dyn ConfigPort) -> Result<HashMap<String, f64>, QtsimError> {
    config
        .get_list(BACKTEST, "lot_overrides")
        .into_iter()
        .map(|item| {
            let (name, lot) = item
                .split_once(':')
                .ok_or_else(|| invalid(BACKTEST, "lot_overrides", format!("'{item}' is not NAME:LOT")))?;
            match lot.trim().parse::<f64>() {
                Ok(lot) if lot > 0.0 => Ok((name.trim().to_string(), lot)),
                _ => Err(invalid(BACKTEST, "lot_overrides", format!("bad lot size in '{item}'"))),
            }
        })
        .collect()
}

fn text(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn number_list(raw: &str, section: &str, key: &str) -> Result<Vec<f64>, QtsimError> {
    list(raw)
        .iter()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| invalid(section, key, format!("'{v}' is not a number")))
        })
        .collect()
}

fn number(config: &dyn ConfigPort, section: &str, key: &str, default: f64) -> Result<f64, QtsimError> {
    match text(config, section, key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(invalid(section, key, format!("{key} must be a number, got '{raw}'"))),
        },
    }
}

fn non_negative(config: &dyn ConfigPort, section: &str, key: &str) -> Result<f64, QtsimError> {
    let v = number(config, section, key, 0.0)?;
    if v < 0.0 {
        return Err(invalid(section, key, format!("{key} must be non-negative")));
    }
    Ok(v)
}

fn count(config: &dyn ConfigPort, key: &str, default: usize) -> Result<usize, QtsimError> {
    match text(config, OPTIMIZE, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| invalid(OPTIMIZE, key, format!("{key} must be a non-negative integer"))),
    }
}

fn flag(config: &dyn ConfigPort, section: &str, key: &str, default: bool) -> Result<bool, QtsimError> {
    match text(config, section, key).map(|s| s.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(invalid(section, key, format!("{key} must be true or false"))),
        },
    }
}

fn date(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<NaiveDate>, QtsimError> {
    text(config, section, key)
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|_| invalid(section, key, format!("invalid {key} format, expected YYYY-MM-DD")))
        })
        .transpose()
}

fn parsed<T>(config: &dyn ConfigPort, section: &str, key: &str, default: T) -> Result<T, QtsimError>
where
    T: FromStr<Err = QtsimError>,
{
    match text(config, section, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| invalid(section, key, e.to_string())),
    }
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> QtsimError {
    QtsimError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::domain::strategy::{BuiltinStrategy, StrategyRole};

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    #[test]
    fn full_backtest_section() {
        let config = make_config(
            r#"
[backtest]
initial_capital = 50000
fee_rate = 0.0003
min_fee = 5
slippage = proportional
slippage_amount = 0.001
cash_policy = fail
allow_short = yes
lot_size = 100
lot_overrides = 510300:10, 600000:200
rebalance = weekly
risk_free_rate = 0.02
start_date = 2020-01-01
end_date = 2024-12-31
"#,
        );
        let bt = backtest_config(&config).unwrap();
        assert_eq!(bt.initial_capital, 50_000.0);
        assert_eq!(bt.costs.min_fee, 5.0);
        assert_eq!(bt.costs.slippage, SlippageModel::Proportional(0.001));
        assert_eq!(bt.cash_policy, CashShortfallPolicy::Fail);
        assert!(bt.allow_short);
        assert_eq!(bt.lots.lot("510300"), 10.0);
        assert_eq!(bt.lots.lot("000001"), 100.0);
        assert_eq!(bt.rebalance, RebalanceFrequency::Weekly);
        assert_eq!(bt.price_field, "close");
        assert_eq!(bt.start_date, NaiveDate::from_ymd_opt(2020, 1, 1));
    }

    #[test]
    fn empty_backtest_section_uses_defaults() {
        let bt = backtest_config(&make_config("[backtest]\n")).unwrap();
        assert_eq!(bt, BacktestConfig::default());
    }

    #[test]
    fn initial_capital_must_be_positive() {
        let err = backtest_config(&make_config("[backtest]\ninitial_capital = 0\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "initial_capital"));
    }

    #[test]
    fn non_numeric_value_is_reported() {
        let err = backtest_config(&make_config("[backtest]\nfee_rate = cheap\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "fee_rate"));
    }

    #[test]
    fn negative_fee_fails() {
        let err = backtest_config(&make_config("[backtest]\nfixed_fee = -1\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "fixed_fee"));
    }

    #[test]
    fn risk_free_rate_out_of_range_fails() {
        let err = backtest_config(&make_config("[backtest]\nrisk_free_rate = 1.5\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "risk_free_rate"));
    }

    #[test]
    fn invalid_date_format_fails() {
        let err = backtest_config(&make_config("[backtest]\nstart_date = 2020/01/01\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "start_date"));
    }

    #[test]
    fn start_after_end_fails() {
        let err = backtest_config(&make_config(
            "[backtest]\nstart_date = 2024-12-31\nend_date = 2020-01-01\n",
        ))
        .unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "start_date"));
    }

    #[test]
    fn bad_rebalance_names_key() {
        let err = backtest_config(&make_config("[backtest]\nrebalance = hourly\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "rebalance"));
    }

    #[test]
    fn operator_from_specs() {
        let config = make_config(
            r#"
[operator]
selecting = select_nday_change(10, 2, largest)
timing = macd(5, 20, 4); dma
timing_weights = 0.75, 0.25
allow_leverage = false
"#,
        );
        let op = operator(&config, &StrategyRegistry::new()).unwrap();
        let kinds: Vec<_> = op.strategies().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![BuiltinStrategy::SelectNdayChange, BuiltinStrategy::Macd, BuiltinStrategy::Dma]
        );
        let macd = op.strategies().nth(1).unwrap();
        assert_eq!(macd.role(), StrategyRole::Timing);
        assert_eq!(macd.params().period(0).unwrap(), 5);
    }

    #[test]
    fn operator_timing_needs_universe_or_selection() {
        let err = operator(&make_config("[operator]\ntiming = long\n"), &StrategyRegistry::new())
            .unwrap_err();
        assert!(matches!(err, QtsimError::IncompatibleRole { .. }));
        let ok = operator(
            &make_config("[operator]\ntiming = long\nuniverse = A, B\n"),
            &StrategyRegistry::new(),
        )
        .unwrap();
        assert_eq!(ok.universe(), Some(&["A".to_string(), "B".to_string()][..]));
    }

    #[test]
    fn unknown_strategy_is_reported() {
        let err = strategy(&StrategyRegistry::new(), "astrology(3)").unwrap_err();
        assert!(matches!(err, QtsimError::UnknownStrategy { .. }));
        let err = strategy(&StrategyRegistry::new(), "macd(1, 2").unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { .. }));
    }

    #[test]
    fn search_section() {
        let config = make_config(
            "[optimize]\nalgorithm = genetic\npopulation = 8\ngenerations = 3\nseed = 42\nworkers = 2\nmetric = sharpe\n",
        );
        let s = search_config(&config).unwrap();
        assert_eq!(s.seed, 42);
        assert_eq!(s.workers, 2);
        assert_eq!(s.metric, ScoreMetric::Sharpe);
        assert!(matches!(s.algorithm, Search::Genetic { population: 8, generations: 3, .. }));
    }

    #[test]
    fn search_section_rejects_bad_rates() {
        let err = search_config(&make_config(
            "[optimize]\nalgorithm = genetic\nmutation_rate = 3\n",
        ))
        .unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "mutation_rate"));
        let err = search_config(&make_config("[optimize]\nalgorithm = hillclimb\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "algorithm"));
    }

    #[test]
    fn search_space_narrows_named_dimensions() {
        let config = make_config(
            "[operator]\ntiming = macd\nuniverse = A\n\n[optimize]\ntiming0.macd.s = 5..8\ntiming0.macd.d = 9\n",
        );
        let op = operator(&config, &StrategyRegistry::new()).unwrap();
        let space = search_space(&config, &op).unwrap();
        let dims = space.dims();
        assert_eq!(dims[0].kind, ParamKind::Integer { min: 5, max: 8 });
        assert_eq!(dims[1].kind, ParamKind::Integer { min: 2, max: 250 });
        assert_eq!(dims[2].kind, ParamKind::Integer { min: 9, max: 9 });
        assert_eq!(space.grid_size(5), 4 * 249);
    }

    #[test]
    fn search_space_rejects_widening() {
        let config = make_config(
            "[operator]\nselecting = select_last_close\n\n[optimize]\nselecting0.select_last_close.count = 0..3\n",
        );
        let op = operator(&config, &StrategyRegistry::new()).unwrap();
        let err = search_space(&config, &op).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigInvalid { key, .. } if key == "selecting0.select_last_close.count"));

        let config = make_config(
            "[operator]\nselecting = select_last_close\n\n[optimize]\nselecting0.select_last_close.order = largest, biggest\n",
        );
        assert!(search_space(&config, &op).is_err());
        let config = make_config(
            "[operator]\nselecting = select_last_close\n\n[optimize]\nselecting0.select_last_close.order = smallest\n",
        );
        let space = search_space(&config, &op).unwrap();
        assert_eq!(space.dims()[1].kind, ParamKind::Categorical(vec!["smallest".into()]));
    }

    #[test]
    fn data_section() {
        let req = data_request(&make_config(
            "[data]\npath = ./prices\ninstruments = A, B\nfill = ffill\n",
        ))
        .unwrap();
        assert_eq!(req.instruments, vec!["A", "B"]);
        assert_eq!(req.fill, FillPolicy::ForwardFill);
        assert_eq!(req.source.as_deref(), Some("./prices"));
        let err = data_request(&make_config("[data]\npath = x\n")).unwrap_err();
        assert!(matches!(err, QtsimError::ConfigMissing { key, .. } if key == "instruments"));
    }
}
