//! Operator: blends selecting, timing and signal strategies into target
//! weights and position deltas per rebalance date.
//!
//! Selecting outputs are combined, restricted to the universe and
//! renormalized to sum 1. Timing outputs scale those weights per instrument.
//! Without any selecting strategy the explicit universe is held in equal
//! weight. Signal outputs never set targets; they become deltas that the
//! simulation applies on top of the current (or target) weights.

use super::error::QtsimError;
use super::history::HistoryCube;
use super::parameter::{ParameterSpace, ParameterVector};
use super::signal::SignalMatrix;
use super::strategy::{Strategy, StrategyRole};

/// How several strategies of one role are merged.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Combination {
    /// Plain average.
    #[default]
    EqualWeight,
    /// Weighted sum; weights are not normalized, so timing rows may exceed 1.
    Fixed(Vec<f64>),
}

impl Combination {
    fn validate(&self, role: StrategyRole, count: usize) -> Result<(), QtsimError> {
        if let Combination::Fixed(w) = self {
            if w.len() != count {
                return Err(QtsimError::incompatible(format!(
                    "{role} combination has {} weights for {count} strategies",
                    w.len()
                )));
            }
            if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
                return Err(QtsimError::incompatible(format!(
                    "{role} combination weights must be finite and non-negative"
                )));
            }
            if count > 0 && w.iter().all(|x| *x == 0.0) {
                return Err(QtsimError::incompatible(format!(
                    "{role} combination weights are all zero"
                )));
            }
        }
        Ok(())
    }

    fn weights(&self, count: usize) -> Vec<f64> {
        match self {
            Combination::EqualWeight => vec![1.0 / count as f64; count],
            Combination::Fixed(w) => w.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RoleGroup {
    strategies: Vec<Strategy>,
    combination: Combination,
}

impl RoleGroup {
    fn empty() -> Self {
        RoleGroup {
            strategies: Vec::new(),
            combination: Combination::EqualWeight,
        }
    }

    /// Combined output of every strategy in the group, or `None` if empty.
    fn combine(&self, window: &HistoryCube) -> Result<Option<SignalMatrix>, QtsimError> {
        if self.strategies.is_empty() {
            return Ok(None);
        }
        let weights = self.combination.weights(self.strategies.len());
        let mut out = SignalMatrix::zeros(window.dates().to_vec(), window.instruments().to_vec());
        for (strategy, w) in self.strategies.iter().zip(weights) {
            let signals = strategy.generate(window)?;
            for d in 0..signals.shape().0 {
                for (acc, v) in out.row_mut(d).iter_mut().zip(signals.row(d)) {
                    *acc += w * v;
                }
            }
        }
        Ok(Some(out))
    }
}

/// Operator rows at rebalance dates.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorOutput {
    /// Absolute target weights; present when a selecting or timing strategy is configured.
    pub targets: Option<SignalMatrix>,
    /// Position deltas in [-1, 1]; present when a signal strategy is configured.
    pub deltas: Option<SignalMatrix>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    selecting: RoleGroup,
    timing: RoleGroup,
    signals: RoleGroup,
    universe: Option<Vec<String>>,
    allow_leverage: bool,
}

impl Default for Operator {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator {
    pub fn new() -> Self {
        Operator {
            selecting: RoleGroup::empty(),
            timing: RoleGroup::empty(),
            signals: RoleGroup::empty(),
            universe: None,
            allow_leverage: false,
        }
    }

    pub fn with_selecting(mut self, strategies: Vec<Strategy>, combination: Combination) -> Self {
        self.selecting = RoleGroup {
            strategies,
            combination,
        };
        self
    }

    pub fn with_timing(mut self, strategies: Vec<Strategy>, combination: Combination) -> Self {
        self.timing = RoleGroup {
            strategies,
            combination,
        };
        self
    }

    pub fn with_signals(mut self, strategies: Vec<Strategy>, combination: Combination) -> Self {
        self.signals = RoleGroup {
            strategies,
            combination,
        };
        self
    }

    pub fn with_universe(mut self, universe: Vec<String>) -> Self {
        self.universe = Some(universe);
        self
    }

    pub fn with_leverage(mut self, allow: bool) -> Self {
        self.allow_leverage = allow;
        self
    }

    pub fn universe(&self) -> Option<&[String]> {
        self.universe.as_deref()
    }

    /// Strategies in slot order: selecting, timing, signal.
    pub fn strategies(&self) -> impl Iterator<Item = &Strategy> {
        self.groups().flat_map(|(_, g)| g.strategies.iter())
    }

    fn groups(&self) -> impl Iterator<Item = (StrategyRole, &RoleGroup)> {
        [
            (StrategyRole::Selecting, &self.selecting),
            (StrategyRole::Timing, &self.timing),
            (StrategyRole::SignalGenerating, &self.signals),
        ]
        .into_iter()
    }

    /// Structural checks on the role layout.
    pub fn validate(&self) -> Result<(), QtsimError> {
        if self.strategies().next().is_none() {
            return Err(QtsimError::incompatible("operator has no strategies"));
        }
        for (role, group) in self.groups() {
            if let Some(s) = group.strategies.iter().find(|s| s.role() != role) {
                return Err(QtsimError::incompatible(format!(
                    "{} is a {} strategy placed in the {role} slot",
                    s.kind(),
                    s.role()
                )));
            }
            group.combination.validate(role, group.strategies.len())?;
        }
        if !self.timing.strategies.is_empty()
            && self.selecting.strategies.is_empty()
            && self.universe.is_none()
        {
            return Err(QtsimError::incompatible(
                "timing strategies need a selecting strategy or an explicit universe",
            ));
        }
        if matches!(&self.universe, Some(u) if u.is_empty()) {
            return Err(QtsimError::incompatible("explicit universe is empty"));
        }
        Ok(())
    }

    /// Union of the fields every strategy reads, in first-seen order.
    pub fn required_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        for f in self.strategies().flat_map(|s| s.required_fields().iter()) {
            if !fields.contains(f) {
                fields.push(*f);
            }
        }
        fields
    }

    /// Concatenated parameter spaces, dimension names prefixed by slot.
    pub fn parameter_space(&self) -> ParameterSpace {
        let parts: Vec<(String, ParameterSpace)> = self
            .groups()
            .flat_map(|(role, g)| {
                g.strategies
                    .iter()
                    .enumerate()
                    .map(move |(i, s)| (format!("{role}{i}.{}", s.kind()), s.parameter_space()))
            })
            .collect();
        ParameterSpace::concat(&parts)
    }

    pub fn parameters(&self) -> ParameterVector {
        let parts: Vec<ParameterVector> = self.strategies().map(|s| s.params().clone()).collect();
        ParameterVector::concat(&parts)
    }

    /// Copy of this operator with every strategy rebound to its slice of `vector`.
    pub fn with_parameters(&self, vector: &ParameterVector) -> Result<Operator, QtsimError> {
        let lengths: Vec<usize> = self.strategies().map(|s| s.parameter_space().len()).collect();
        let mut parts = vector.split(&lengths)?.into_iter();
        let mut rebind = |group: &RoleGroup| -> Result<RoleGroup, QtsimError> {
            let strategies = group
                .strategies
                .iter()
                .map(|s| {
                    let params = parts.next().unwrap_or_default();
                    Strategy::new(s.kind(), params)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RoleGroup {
                strategies,
                combination: group.combination.clone(),
            })
        };
        Ok(Operator {
            selecting: rebind(&self.selecting)?,
            timing: rebind(&self.timing)?,
            signals: rebind(&self.signals)?,
            universe: self.universe.clone(),
            allow_leverage: self.allow_leverage,
        })
    }

    /// Blend every strategy over `window` and keep the `rows` (rebalance
    /// date indices into the window).
    pub fn compose(&self, window: &HistoryCube, rows: &[usize]) -> Result<OperatorOutput, QtsimError> {
        self.validate()?;
        if let Some(&r) = rows.iter().find(|&&r| r >= window.dates().len()) {
            return Err(QtsimError::breach(format!(
                "rebalance row {r} outside window of {} dates",
                window.dates().len()
            )));
        }
        let n_inst = window.instruments().len();
        let mask: Vec<bool> = match &self.universe {
            Some(universe) => {
                let mut mask = vec![false; n_inst];
                for name in universe {
                    mask[window.require_instrument(name)?] = true;
                }
                mask
            }
            None => vec![true; n_inst],
        };
        let members = mask.iter().filter(|m| **m).count();

        let selecting = self.selecting.combine(window)?;
        let timing = self.timing.combine(window)?;
        let targets = if selecting.is_some() || timing.is_some() {
            let mut t = SignalMatrix::zeros(window.dates().to_vec(), window.instruments().to_vec());
            for d in 0..window.dates().len() {
                let row = t.row_mut(d);
                match &selecting {
                    Some(sel) => {
                        for (i, w) in row.iter_mut().enumerate() {
                            *w = if mask[i] { sel.get(d, i).max(0.0) } else { 0.0 };
                        }
                        let sum: f64 = row.iter().sum();
                        if sum > 0.0 {
                            row.iter_mut().for_each(|w| *w /= sum);
                        }
                    }
                    None => {
                        for (i, w) in row.iter_mut().enumerate() {
                            *w = if mask[i] { 1.0 / members as f64 } else { 0.0 };
                        }
                    }
                }
                if let Some(tim) = &timing {
                    for (i, w) in row.iter_mut().enumerate() {
                        *w *= tim.get(d, i);
                    }
                }
                if !self.allow_leverage {
                    let gross: f64 = row.iter().map(|w| w.abs()).sum();
                    if gross > 1.0 {
                        row.iter_mut().for_each(|w| *w /= gross);
                    }
                }
            }
            Some(t.select_rows(rows))
        } else {
            None
        };

        let deltas = match self.signals.combine(window)? {
            Some(mut s) => {
                for d in 0..window.dates().len() {
                    for (i, v) in s.row_mut(d).iter_mut().enumerate() {
                        *v = if mask[i] { v.clamp(-1.0, 1.0) } else { 0.0 };
                    }
                }
                Some(s.select_rows(rows))
            }
            None => None,
        };

        Ok(OperatorOutput { targets, deltas })
    }
}
