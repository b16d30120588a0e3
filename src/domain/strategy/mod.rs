//! Built-in strategies and their roles.
//!
//! A strategy maps a history window and a parameter vector to a
//! [`SignalMatrix`] with one row per window date and one column per window
//! instrument. Every built-in is causal: the row for date `t` only reads data
//! up to and including `t`. Warmup positions produce a neutral 0.

mod selecting;
mod signals;
mod timing;

use std::fmt;

use super::error::QtsimError;
use super::history::HistoryCube;
use super::parameter::{ParamDim, ParamValue, ParameterSpace, ParameterVector};
use super::signal::SignalMatrix;

pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
/// Earnings per share, as reported.
pub const EPS: &str = "eps";

/// Bound on the factor filter thresholds of [`BuiltinStrategy::SelectFinance`].
const FACTOR_BOUND: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StrategyRole {
    /// Chooses instruments and allocation weights (row weights in [0, 1]).
    Selecting,
    /// Per-instrument position target in [-1, 1].
    Timing,
    /// Discrete trade signals in {-1, 0, 1}.
    SignalGenerating,
}

impl fmt::Display for StrategyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyRole::Selecting => "selecting",
            StrategyRole::Timing => "timing",
            StrategyRole::SignalGenerating => "signal",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BuiltinStrategy {
    Crossline,
    Macd,
    Trix,
    Dma,
    Long,
    Short,
    Zero,
    Cdl,
    BBand,
    Urgent,
    RiconNone,
    SelectAll,
    SelectNone,
    SelectRandom,
    SelectFinance,
    SelectNdayChange,
    SelectAvgOpen,
    SelectAvgClose,
    SelectAvgHigh,
    SelectAvgLow,
    SelectLastOpen,
    SelectLastClose,
    SelectLastHigh,
    SelectLastLow,
}

impl BuiltinStrategy {
    pub const ALL: [BuiltinStrategy; 24] = [
        BuiltinStrategy::Crossline,
        BuiltinStrategy::Macd,
        BuiltinStrategy::Trix,
        BuiltinStrategy::Dma,
        BuiltinStrategy::Long,
        BuiltinStrategy::Short,
        BuiltinStrategy::Zero,
        BuiltinStrategy::Cdl,
        BuiltinStrategy::BBand,
        BuiltinStrategy::Urgent,
        BuiltinStrategy::RiconNone,
        BuiltinStrategy::SelectAll,
        BuiltinStrategy::SelectNone,
        BuiltinStrategy::SelectRandom,
        BuiltinStrategy::SelectFinance,
        BuiltinStrategy::SelectNdayChange,
        BuiltinStrategy::SelectAvgOpen,
        BuiltinStrategy::SelectAvgClose,
        BuiltinStrategy::SelectAvgHigh,
        BuiltinStrategy::SelectAvgLow,
        BuiltinStrategy::SelectLastOpen,
        BuiltinStrategy::SelectLastClose,
        BuiltinStrategy::SelectLastHigh,
        BuiltinStrategy::SelectLastLow,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BuiltinStrategy::Crossline => "crossline",
            BuiltinStrategy::Macd => "macd",
            BuiltinStrategy::Trix => "trix",
            BuiltinStrategy::Dma => "dma",
            BuiltinStrategy::Long => "long",
            BuiltinStrategy::Short => "short",
            BuiltinStrategy::Zero => "zero",
            BuiltinStrategy::Cdl => "cdl",
            BuiltinStrategy::BBand => "bband",
            BuiltinStrategy::Urgent => "urgent",
            BuiltinStrategy::RiconNone => "ricon_none",
            BuiltinStrategy::SelectAll => "select_all",
            BuiltinStrategy::SelectNone => "select_none",
            BuiltinStrategy::SelectRandom => "select_random",
            BuiltinStrategy::SelectFinance => "select_finance",
            BuiltinStrategy::SelectNdayChange => "select_nday_change",
            BuiltinStrategy::SelectAvgOpen => "select_avg_open",
            BuiltinStrategy::SelectAvgClose => "select_avg_close",
            BuiltinStrategy::SelectAvgHigh => "select_avg_high",
            BuiltinStrategy::SelectAvgLow => "select_avg_low",
            BuiltinStrategy::SelectLastOpen => "select_last_open",
            BuiltinStrategy::SelectLastClose => "select_last_close",
            BuiltinStrategy::SelectLastHigh => "select_last_high",
            BuiltinStrategy::SelectLastLow => "select_last_low",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BuiltinStrategy::Crossline => "long while the short SMA stays above the long SMA by margin m",
            BuiltinStrategy::Macd => "long while the MACD histogram is positive",
            BuiltinStrategy::Trix => "long while TRIX is above its own SMA",
            BuiltinStrategy::Dma => "long while the SMA difference is above its own SMA",
            BuiltinStrategy::Long => "always fully long",
            BuiltinStrategy::Short => "always fully short",
            BuiltinStrategy::Zero => "always flat",
            BuiltinStrategy::Cdl => "long while a doji candle appeared in the last n days",
            BuiltinStrategy::BBand => "buy on lower band re-entry, sell on upper band re-entry",
            BuiltinStrategy::Urgent => "sell when the n-day change drops below a threshold",
            BuiltinStrategy::RiconNone => "no risk control, never signals",
            BuiltinStrategy::SelectAll => "every instrument, equal weight",
            BuiltinStrategy::SelectNone => "no instrument",
            BuiltinStrategy::SelectRandom => "random subset (probability p < 1, else count), equal weight",
            BuiltinStrategy::SelectFinance => "top or bottom instruments by n-day mean EPS, optionally bounded",
            BuiltinStrategy::SelectNdayChange => "top or bottom instruments by n-day change",
            BuiltinStrategy::SelectAvgOpen => "top or bottom instruments by n-day average open",
            BuiltinStrategy::SelectAvgClose => "top or bottom instruments by n-day average close",
            BuiltinStrategy::SelectAvgHigh => "top or bottom instruments by n-day average high",
            BuiltinStrategy::SelectAvgLow => "top or bottom instruments by n-day average low",
            BuiltinStrategy::SelectLastOpen => "top or bottom instruments by latest open",
            BuiltinStrategy::SelectLastClose => "top or bottom instruments by latest close",
            BuiltinStrategy::SelectLastHigh => "top or bottom instruments by latest high",
            BuiltinStrategy::SelectLastLow => "top or bottom instruments by latest low",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.id() == id)
    }

    pub fn role(&self) -> StrategyRole {
        match self {
            BuiltinStrategy::Crossline
            | BuiltinStrategy::Macd
            | BuiltinStrategy::Trix
            | BuiltinStrategy::Dma
            | BuiltinStrategy::Long
            | BuiltinStrategy::Short
            | BuiltinStrategy::Zero
            | BuiltinStrategy::Cdl => StrategyRole::Timing,
            BuiltinStrategy::BBand | BuiltinStrategy::Urgent | BuiltinStrategy::RiconNone => {
                StrategyRole::SignalGenerating
            }
            BuiltinStrategy::SelectAll
            | BuiltinStrategy::SelectNone
            | BuiltinStrategy::SelectRandom
            | BuiltinStrategy::SelectFinance
            | BuiltinStrategy::SelectNdayChange
            | BuiltinStrategy::SelectAvgOpen
            | BuiltinStrategy::SelectAvgClose
            | BuiltinStrategy::SelectAvgHigh
            | BuiltinStrategy::SelectAvgLow
            | BuiltinStrategy::SelectLastOpen
            | BuiltinStrategy::SelectLastClose
            | BuiltinStrategy::SelectLastHigh
            | BuiltinStrategy::SelectLastLow => StrategyRole::Selecting,
        }
    }

    /// Field a factor selector ranks instruments by.
    pub fn factor_field(&self) -> Option<&'static str> {
        match self {
            BuiltinStrategy::SelectNdayChange
            | BuiltinStrategy::SelectAvgClose
            | BuiltinStrategy::SelectLastClose => Some(CLOSE),
            BuiltinStrategy::SelectAvgOpen | BuiltinStrategy::SelectLastOpen => Some(OPEN),
            BuiltinStrategy::SelectAvgHigh | BuiltinStrategy::SelectLastHigh => Some(HIGH),
            BuiltinStrategy::SelectAvgLow | BuiltinStrategy::SelectLastLow => Some(LOW),
            BuiltinStrategy::SelectFinance => Some(EPS),
            _ => None,
        }
    }

    /// Fields the strategy reads from its window.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            BuiltinStrategy::Long
            | BuiltinStrategy::Short
            | BuiltinStrategy::Zero
            | BuiltinStrategy::SelectAll
            | BuiltinStrategy::SelectNone
            | BuiltinStrategy::SelectRandom
            | BuiltinStrategy::RiconNone => &[],
            BuiltinStrategy::BBand => &[CLOSE, HIGH, LOW],
            BuiltinStrategy::Cdl => &[OPEN, HIGH, LOW, CLOSE],
            BuiltinStrategy::SelectAvgOpen | BuiltinStrategy::SelectLastOpen => &[OPEN],
            BuiltinStrategy::SelectAvgHigh | BuiltinStrategy::SelectLastHigh => &[HIGH],
            BuiltinStrategy::SelectAvgLow | BuiltinStrategy::SelectLastLow => &[LOW],
            BuiltinStrategy::SelectFinance => &[EPS],
            _ => &[CLOSE],
        }
    }

    pub fn parameter_space(&self) -> ParameterSpace {
        let dims = match self {
            BuiltinStrategy::Crossline => vec![
                ParamDim::integer("s", 2, 250),
                ParamDim::integer("l", 2, 250),
                ParamDim::continuous("m", 0.0, 100.0),
                ParamDim::categorical("hesitate", &["buy", "sell", "none"]),
            ],
            BuiltinStrategy::Macd | BuiltinStrategy::Dma => vec![
                ParamDim::integer("s", 2, 250),
                ParamDim::integer("l", 2, 250),
                ParamDim::integer("d", 2, 250),
            ],
            BuiltinStrategy::Trix => vec![ParamDim::integer("s", 2, 50), ParamDim::integer("m", 3, 150)],
            BuiltinStrategy::Cdl => vec![ParamDim::integer("n", 1, 250)],
            BuiltinStrategy::BBand => vec![
                ParamDim::integer("span", 2, 250),
                ParamDim::continuous("upper", 0.5, 2.5),
                ParamDim::continuous("lower", 0.5, 2.5),
            ],
            BuiltinStrategy::Urgent => vec![
                ParamDim::integer("n", 1, 40),
                ParamDim::continuous("drop", -0.5, 0.5),
            ],
            BuiltinStrategy::SelectRandom => vec![
                ParamDim::continuous("p", 0.0, 1000.0),
                ParamDim::integer("seed", 0, i64::from(u32::MAX)),
            ],
            BuiltinStrategy::SelectNdayChange
            | BuiltinStrategy::SelectAvgOpen
            | BuiltinStrategy::SelectAvgClose
            | BuiltinStrategy::SelectAvgHigh
            | BuiltinStrategy::SelectAvgLow => vec![
                ParamDim::integer("n", 1, 250),
                ParamDim::integer("count", 1, 1000),
                ParamDim::categorical("order", &["largest", "smallest"]),
            ],
            BuiltinStrategy::SelectLastOpen
            | BuiltinStrategy::SelectLastClose
            | BuiltinStrategy::SelectLastHigh
            | BuiltinStrategy::SelectLastLow => vec![
                ParamDim::integer("count", 1, 1000),
                ParamDim::categorical("order", &["largest", "smallest"]),
            ],
            BuiltinStrategy::SelectFinance => vec![
                ParamDim::integer("n", 1, 250),
                ParamDim::integer("count", 1, 1000),
                ParamDim::categorical("order", &["largest", "smallest"]),
                ParamDim::categorical(
                    "condition",
                    &["any", "greater", "less", "between", "not_between"],
                ),
                ParamDim::continuous("lower", -FACTOR_BOUND, FACTOR_BOUND),
                ParamDim::continuous("upper", -FACTOR_BOUND, FACTOR_BOUND),
            ],
            BuiltinStrategy::Long
            | BuiltinStrategy::Short
            | BuiltinStrategy::Zero
            | BuiltinStrategy::RiconNone
            | BuiltinStrategy::SelectAll
            | BuiltinStrategy::SelectNone => Vec::new(),
        };
        ParameterSpace::new(dims)
    }

    pub fn default_parameters(&self) -> ParameterVector {
        use ParamValue::{Category as C, Float as F, Int as I};
        let values = match self {
            BuiltinStrategy::Crossline => vec![I(35), I(120), F(0.0), C("none".into())],
            BuiltinStrategy::Macd => vec![I(12), I(26), I(9)],
            BuiltinStrategy::Dma => vec![I(12), I(26), I(9)],
            BuiltinStrategy::Trix => vec![I(12), I(20)],
            BuiltinStrategy::Cdl => vec![I(20)],
            BuiltinStrategy::BBand => vec![I(20), F(2.0), F(2.0)],
            BuiltinStrategy::Urgent => vec![I(5), F(-0.1)],
            BuiltinStrategy::SelectRandom => vec![F(0.5), I(0)],
            BuiltinStrategy::SelectNdayChange
            | BuiltinStrategy::SelectAvgOpen
            | BuiltinStrategy::SelectAvgClose
            | BuiltinStrategy::SelectAvgHigh
            | BuiltinStrategy::SelectAvgLow => vec![I(20), I(5), C("largest".into())],
            BuiltinStrategy::SelectLastOpen
            | BuiltinStrategy::SelectLastClose
            | BuiltinStrategy::SelectLastHigh
            | BuiltinStrategy::SelectLastLow => vec![I(5), C("largest".into())],
            BuiltinStrategy::SelectFinance => vec![
                I(60),
                I(5),
                C("largest".into()),
                C("any".into()),
                F(0.0),
                F(0.0),
            ],
            BuiltinStrategy::Long
            | BuiltinStrategy::Short
            | BuiltinStrategy::Zero
            | BuiltinStrategy::RiconNone
            | BuiltinStrategy::SelectAll
            | BuiltinStrategy::SelectNone => Vec::new(),
        };
        ParameterVector::new(values)
    }

    /// Signals for every date and instrument of `window`.
    pub fn generate(
        &self,
        window: &HistoryCube,
        params: &ParameterVector,
    ) -> Result<SignalMatrix, QtsimError> {
        self.parameter_space().validate(params)?;
        let mut out = SignalMatrix::zeros(window.dates().to_vec(), window.instruments().to_vec());
        match self {
            BuiltinStrategy::Crossline
            | BuiltinStrategy::Macd
            | BuiltinStrategy::Trix
            | BuiltinStrategy::Dma
            | BuiltinStrategy::Long
            | BuiltinStrategy::Short
            | BuiltinStrategy::Zero => {
                let close = self.field_index(window, CLOSE)?;
                for i in 0..window.instruments().len() {
                    let series = close.map(|f| window.series(i, f)).unwrap_or(&[]);
                    let column = timing::column(*self, series, window.dates().len(), params)?;
                    out.set_column(i, &column)?;
                }
            }
            BuiltinStrategy::BBand => {
                let (c, h, l) = (
                    window.require_field(CLOSE)?,
                    window.require_field(HIGH)?,
                    window.require_field(LOW)?,
                );
                for i in 0..window.instruments().len() {
                    let column = signals::bband(
                        window.series(i, c),
                        window.series(i, h),
                        window.series(i, l),
                        params,
                    )?;
                    out.set_column(i, &column)?;
                }
            }
            BuiltinStrategy::Cdl => {
                let (o, h, l, c) = (
                    window.require_field(OPEN)?,
                    window.require_field(HIGH)?,
                    window.require_field(LOW)?,
                    window.require_field(CLOSE)?,
                );
                for i in 0..window.instruments().len() {
                    let candles = timing::Candles {
                        open: window.series(i, o),
                        high: window.series(i, h),
                        low: window.series(i, l),
                        close: window.series(i, c),
                    };
                    let column = timing::cdl(&candles, params)?;
                    out.set_column(i, &column)?;
                }
            }
            BuiltinStrategy::Urgent => {
                let c = window.require_field(CLOSE)?;
                for i in 0..window.instruments().len() {
                    let column = signals::urgent(window.series(i, c), params)?;
                    out.set_column(i, &column)?;
                }
            }
            BuiltinStrategy::RiconNone => {}
            BuiltinStrategy::SelectAll
            | BuiltinStrategy::SelectNone
            | BuiltinStrategy::SelectRandom
            | BuiltinStrategy::SelectFinance
            | BuiltinStrategy::SelectNdayChange
            | BuiltinStrategy::SelectAvgOpen
            | BuiltinStrategy::SelectAvgClose
            | BuiltinStrategy::SelectAvgHigh
            | BuiltinStrategy::SelectAvgLow
            | BuiltinStrategy::SelectLastOpen
            | BuiltinStrategy::SelectLastClose
            | BuiltinStrategy::SelectLastHigh
            | BuiltinStrategy::SelectLastLow => {
                selecting::fill(*self, window, params, &mut out)?;
            }
        }
        Ok(out)
    }

    fn field_index(&self, window: &HistoryCube, field: &str) -> Result<Option<usize>, QtsimError> {
        if self.required_fields().contains(&field) {
            window.require_field(field).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl fmt::Display for BuiltinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A built-in strategy bound to a validated parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    kind: BuiltinStrategy,
    params: ParameterVector,
}

impl Strategy {
    pub fn new(kind: BuiltinStrategy, params: ParameterVector) -> Result<Self, QtsimError> {
        kind.parameter_space().validate(&params)?;
        Ok(Strategy { kind, params })
    }

    pub fn with_defaults(kind: BuiltinStrategy) -> Self {
        Strategy {
            kind,
            params: kind.default_parameters(),
        }
    }

    pub fn kind(&self) -> BuiltinStrategy {
        self.kind
    }

    pub fn role(&self) -> StrategyRole {
        self.kind.role()
    }

    pub fn params(&self) -> &ParameterVector {
        &self.params
    }

    pub fn parameter_space(&self) -> ParameterSpace {
        self.kind.parameter_space()
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        self.kind.required_fields()
    }

    pub fn generate(&self, window: &HistoryCube) -> Result<SignalMatrix, QtsimError> {
        self.kind.generate(window, &self.params)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::cube;
    use super::*;

    #[test]
    fn ids_round_trip() {
        for s in BuiltinStrategy::ALL {
            assert_eq!(BuiltinStrategy::from_id(s.id()), Some(s));
        }
        assert_eq!(BuiltinStrategy::from_id("nope"), None);
    }

    #[test]
    fn defaults_satisfy_their_space() {
        for s in BuiltinStrategy::ALL {
            assert!(
                s.parameter_space().validate(&s.default_parameters()).is_ok(),
                "{s}"
            );
        }
    }

    #[test]
    fn every_builtin_is_deterministic() {
        let a: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0).collect();
        let b: Vec<f64> = (0..80).map(|i| 50.0 + i as f64 * 0.2).collect();
        let window = cube(&[("A", &a), ("B", &b)]);
        for s in BuiltinStrategy::ALL {
            let params = s.default_parameters();
            let first = s.generate(&window, &params).unwrap();
            let second = s.generate(&window, &params).unwrap();
            let bits = |m: &SignalMatrix| m.as_slice().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&first), bits(&second), "{s}");
            assert_eq!(first.shape(), (80, 2));
        }
    }

    #[test]
    fn outputs_stay_in_role_range() {
        let a: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.5).cos() * 8.0).collect();
        let window = cube(&[("A", &a), ("B", &a)]);
        for s in BuiltinStrategy::ALL {
            let m = s.generate(&window, &s.default_parameters()).unwrap();
            for v in m.as_slice() {
                assert!(v.is_finite(), "{s}");
                match s.role() {
                    StrategyRole::Selecting => assert!((0.0..=1.0).contains(v), "{s}"),
                    _ => assert!((-1.0..=1.0).contains(v), "{s}"),
                }
            }
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let bad = ParameterVector::new(vec![ParamValue::Int(1)]);
        assert!(matches!(
            Strategy::new(BuiltinStrategy::Macd, bad),
            Err(QtsimError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn missing_field_is_unknown_label() {
        let mut b = crate::domain::history::HistoryCubeBuilder::new();
        b.record("A", "open", test_support::date(0), 1.0);
        let window = b.build().unwrap();
        let err = Strategy::with_defaults(BuiltinStrategy::Macd)
            .generate(&window)
            .unwrap_err();
        assert!(matches!(err, QtsimError::UnknownLabel { .. }));
        // strategies that read no field still work
        assert!(Strategy::with_defaults(BuiltinStrategy::Long).generate(&window).is_ok());
    }
}
