//! Parameter search over an operator template.
//!
//! Every search strategy proposes [`ParameterVector`]s, the worker pool runs
//! one backtest per new vector and the strategy reads back scalar scores.
//! All randomness is drawn on the coordinating thread from a seeded
//! [`StdRng`], so results do not depend on the number of workers.

mod pool;

pub use pool::StopSignal;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::backtest::{run_backtest, BacktestConfig, BacktestResult};
use super::error::QtsimError;
use super::history::HistoryView;
use super::metrics::{Metrics, ScoreMetric};
use super::operator::Operator;
use super::parameter::{ParameterSpace, ParameterVector};

/// Grids larger than this are refused instead of exhausting memory.
pub const MAX_GRID_POINTS: u128 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Search {
    /// Exhaustive cartesian product; continuous dimensions get
    /// `continuous_steps` evenly spaced values.
    Grid { continuous_steps: usize },
    Random { samples: usize },
    Genetic {
        population: usize,
        generations: usize,
        crossover_rate: f64,
        mutation_rate: f64,
        elite: usize,
    },
    /// Independent simulated-annealing chains with geometric cooling.
    Annealing {
        chains: usize,
        iterations: usize,
        initial_temperature: f64,
        cooling: f64,
    },
}

impl Default for Search {
    fn default() -> Self {
        Search::Grid { continuous_steps: 5 }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchConfig {
    pub algorithm: Search,
    pub seed: u64,
    pub workers: usize,
    pub metric: ScoreMetric,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            algorithm: Search::default(),
            seed: 0,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            metric: ScoreMetric::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), QtsimError> {
        let positive = |name: &str, v: usize| {
            if v == 0 {
                Err(QtsimError::invalid_param(name, "must be at least 1"))
            } else {
                Ok(())
            }
        };
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(QtsimError::invalid_param(name, "must lie in [0, 1]"))
            }
        };
        positive("workers", self.workers)?;
        match self.algorithm {
            Search::Grid { continuous_steps } => positive("continuous_steps", continuous_steps),
            Search::Random { samples } => positive("samples", samples),
            Search::Genetic {
                population,
                generations,
                crossover_rate,
                mutation_rate,
                elite,
            } => {
                positive("population", population)?;
                positive("generations", generations)?;
                unit("crossover_rate", crossover_rate)?;
                unit("mutation_rate", mutation_rate)?;
                if elite > population {
                    return Err(QtsimError::invalid_param("elite", "exceeds population"));
                }
                Ok(())
            }
            Search::Annealing {
                chains,
                iterations,
                initial_temperature,
                cooling,
            } => {
                positive("chains", chains)?;
                positive("iterations", iterations)?;
                if !(initial_temperature.is_finite() && initial_temperature > 0.0) {
                    return Err(QtsimError::invalid_param(
                        "initial_temperature",
                        "must be positive",
                    ));
                }
                if !(cooling > 0.0 && cooling <= 1.0) {
                    return Err(QtsimError::invalid_param("cooling", "must lie in (0, 1]"));
                }
                Ok(())
            }
        }
    }
}

/// One successfully evaluated parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub params: ParameterVector,
    pub score: Option<f64>,
    pub metrics: Metrics,
    pub result: BacktestResult,
    /// Position in generation order.
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedCandidate {
    pub params: ParameterVector,
    pub ordinal: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimizationResult {
    /// Best first; see [`rank`].
    pub ranked: Vec<Candidate>,
    pub failures: Vec<FailedCandidate>,
    /// Unique vectors whose run completed, successfully or not.
    pub evaluated: usize,
    pub cancelled: bool,
}

impl OptimizationResult {
    pub fn best(&self) -> Option<&Candidate> {
        self.ranked.first()
    }
}

/// Search `space` for the parameter vectors of `template` that score best
/// under `search.metric`.
pub fn optimize(
    template: &Operator,
    space: &ParameterSpace,
    search: &SearchConfig,
    view: &HistoryView,
    config: &BacktestConfig,
    stop: &StopSignal,
) -> Result<OptimizationResult, QtsimError> {
    search.validate()?;
    config.validate()?;
    template.validate()?;
    if !space.is_feasible() {
        return Err(QtsimError::EmptySearchSpace {
            reason: "a dimension has no legal value".to_string(),
        });
    }
    if space.len() != template.parameter_space().len() {
        return Err(QtsimError::EmptySearchSpace {
            reason: format!(
                "space has {} dimensions, operator takes {}",
                space.len(),
                template.parameter_space().len()
            ),
        });
    }

    info!(
        algorithm = ?search.algorithm,
        dimensions = space.len(),
        workers = search.workers,
        metric = %search.metric,
        "optimization started"
    );
    let mut searcher = Searcher {
        job: Job {
            template,
            view,
            config,
            metric: search.metric,
        },
        workers: search.workers,
        stop,
        scores: HashMap::new(),
        candidates: Vec::new(),
        failures: Vec::new(),
        next_ordinal: 0,
        cancelled: false,
    };
    let mut rng = StdRng::seed_from_u64(search.seed);

    match search.algorithm {
        Search::Grid { continuous_steps } => {
            let size = space.grid_size(continuous_steps);
            if size > MAX_GRID_POINTS {
                return Err(QtsimError::invalid_param(
                    "continuous_steps",
                    format!("grid of {size} points exceeds {MAX_GRID_POINTS}"),
                ));
            }
            searcher.evaluate(space.grid(continuous_steps));
        }
        Search::Random { samples } => {
            let vectors = (0..samples).map(|_| space.sample(&mut rng)).collect();
            searcher.evaluate(vectors);
        }
        Search::Genetic {
            population,
            generations,
            crossover_rate,
            mutation_rate,
            elite,
        } => {
            let mut members: Vec<ParameterVector> =
                (0..population).map(|_| space.sample(&mut rng)).collect();
            for generation in 0..generations {
                let scores = searcher.evaluate(members.clone());
                debug!(generation, best = ?best_score(&scores), "generation evaluated");
                if searcher.cancelled || generation + 1 == generations {
                    break;
                }
                let mut order: Vec<usize> = (0..members.len()).collect();
                order.sort_by(|&a, &b| compare_scores(scores[a], scores[b]));
                let mut next: Vec<ParameterVector> =
                    order.iter().take(elite).map(|&i| members[i].clone()).collect();
                while next.len() < population {
                    let a = tournament(&scores, &mut rng);
                    let b = tournament(&scores, &mut rng);
                    let child = if rng.gen_bool(crossover_rate) {
                        space.crossover(&members[a], &members[b], &mut rng)
                    } else {
                        members[a].clone()
                    };
                    next.push(space.mutate(&child, mutation_rate, &mut rng));
                }
                members = next;
            }
        }
        Search::Annealing {
            chains,
            iterations,
            initial_temperature,
            cooling,
        } => {
            let mut current: Vec<ParameterVector> =
                (0..chains).map(|_| space.sample(&mut rng)).collect();
            let mut current_scores = searcher.evaluate(current.clone());
            let mut temperature = initial_temperature;
            for _ in 0..iterations {
                if searcher.cancelled {
                    break;
                }
                // step size shrinks with the temperature
                let scale = (0.25 * temperature / initial_temperature).max(0.01);
                let proposals: Vec<ParameterVector> = current
                    .iter()
                    .map(|v| space.neighbor(v, scale, &mut rng))
                    .collect();
                let scores = searcher.evaluate(proposals.clone());
                for (c, proposal) in proposals.into_iter().enumerate() {
                    let accept = match (scores[c], current_scores[c]) {
                        (Some(new), Some(old)) => {
                            new >= old || rng.r#gen::<f64>() < ((new - old) / temperature).exp()
                        }
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if accept {
                        current[c] = proposal;
                        current_scores[c] = scores[c];
                    }
                }
                temperature *= cooling;
            }
        }
    }

    Ok(searcher.finish())
}

/// Best-first ordering: valued scores descending, then lower turnover, then
/// earlier generation order.
pub fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    compare_scores(a.score, b.score)
        .then_with(|| {
            let ta = a.metrics.turnover.unwrap_or(f64::INFINITY);
            let tb = b.metrics.turnover.unwrap_or(f64::INFINITY);
            ta.total_cmp(&tb)
        })
        .then(a.ordinal.cmp(&b.ordinal))
}

/// Descending by score with `None` last.
fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn best_score(scores: &[Option<f64>]) -> Option<f64> {
    scores.iter().flatten().copied().reduce(f64::max)
}

/// Index of the better of two random members.
fn tournament(scores: &[Option<f64>], rng: &mut StdRng) -> usize {
    let a = rng.gen_range(0..scores.len());
    let b = rng.gen_range(0..scores.len());
    if compare_scores(scores[b], scores[a]) == Ordering::Less { b } else { a }
}

/// Everything a worker needs to turn a vector into a scored backtest.
#[derive(Clone, Copy)]
struct Job<'a> {
    template: &'a Operator,
    view: &'a HistoryView,
    config: &'a BacktestConfig,
    metric: ScoreMetric,
}

impl Job<'_> {
    fn run(&self, params: &ParameterVector) -> Result<(Metrics, BacktestResult), QtsimError> {
        let operator = self.template.with_parameters(params)?;
        let result = run_backtest(&operator, self.view, self.config)?;
        let metrics = Metrics::evaluate(&result, self.config.risk_free_rate);
        Ok((metrics, result))
    }
}

struct Searcher<'a> {
    job: Job<'a>,
    workers: usize,
    stop: &'a StopSignal,
    /// Score of every vector already run; failures score `None`.
    scores: HashMap<ParameterVector, Option<f64>>,
    candidates: Vec<Candidate>,
    failures: Vec<FailedCandidate>,
    next_ordinal: usize,
    cancelled: bool,
}

impl Searcher<'_> {
    /// Run every vector not seen before and return scores aligned with
    /// `vectors`. Vectors skipped by cancellation score `None`.
    fn evaluate(&mut self, vectors: Vec<ParameterVector>) -> Vec<Option<f64>> {
        let mut seen = HashSet::new();
        let fresh: Vec<ParameterVector> = vectors
            .iter()
            .filter(|v| !self.scores.contains_key(*v) && seen.insert(*v))
            .cloned()
            .collect();

        if !fresh.is_empty() && !self.cancelled {
            let base = self.next_ordinal;
            self.next_ordinal += fresh.len();
            let job = self.job;
            let batch = pool::run_batch(fresh, self.workers, self.stop, |params| {
                let outcome = job.run(&params);
                (params, outcome)
            });
            self.cancelled |= batch.cancelled;
            for (i, (params, outcome)) in batch.results {
                self.record(base + i, params, outcome);
            }
        }

        vectors
            .iter()
            .map(|v| self.scores.get(v).copied().flatten())
            .collect()
    }

    fn record(
        &mut self,
        ordinal: usize,
        params: ParameterVector,
        outcome: Result<(Metrics, BacktestResult), QtsimError>,
    ) {
        match outcome {
            Ok((metrics, result)) => {
                let score = metrics.score(self.job.metric);
                debug!(ordinal, params = %params, ?score, "candidate evaluated");
                self.scores.insert(params.clone(), score);
                self.candidates.push(Candidate {
                    params,
                    score,
                    metrics,
                    result,
                    ordinal,
                });
            }
            Err(e) => {
                warn!(ordinal, params = %params, error = %e, "candidate failed");
                self.scores.insert(params.clone(), None);
                self.failures.push(FailedCandidate {
                    params,
                    ordinal,
                    error: e.to_string(),
                });
            }
        }
    }

    fn finish(self) -> OptimizationResult {
        let mut ranked = self.candidates;
        ranked.sort_by(rank);
        let mut failures = self.failures;
        failures.sort_by_key(|f| f.ordinal);
        let evaluated = ranked.len() + failures.len();
        info!(
            evaluated,
            failed = failures.len(),
            cancelled = self.cancelled,
            best = ?ranked.first().and_then(|c| c.score),
            "optimization finished"
        );
        OptimizationResult {
            ranked,
            failures,
            evaluated,
            cancelled: self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history::FillPolicy;
    use crate::domain::operator::Combination;
    use crate::domain::parameter::{ParamDim, ParamValue};
    use crate::domain::strategy::test_support::cube;
    use crate::domain::strategy::{BuiltinStrategy, Strategy};

    fn view() -> HistoryView {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + 10.0 * (i as f64 / 6.0).sin() + 0.2 * i as f64)
            .collect();
        HistoryView::new(cube(&[("A", &closes)]), FillPolicy::None)
    }

    fn template() -> Operator {
        Operator::new()
            .with_universe(vec!["A".to_string()])
            .with_timing(
                vec![Strategy::with_defaults(BuiltinStrategy::Macd)],
                Combination::EqualWeight,
            )
    }

    fn small_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            ParamDim::integer("timing0.macd.s", 2, 4),
            ParamDim::integer("timing0.macd.l", 8, 9),
            ParamDim::integer("timing0.macd.d", 3, 3),
        ])
    }

    fn search(algorithm: Search, workers: usize) -> SearchConfig {
        SearchConfig {
            algorithm,
            seed: 7,
            workers,
            metric: ScoreMetric::TotalReturn,
        }
    }

    #[test]
    fn grid_evaluates_every_point_once() {
        let result = optimize(
            &template(),
            &small_space(),
            &search(Search::Grid { continuous_steps: 2 }, 3),
            &view(),
            &BacktestConfig::default(),
            &StopSignal::new(),
        )
        .unwrap();
        assert_eq!(result.evaluated, 6);
        assert_eq!(result.ranked.len(), 6);
        assert!(result.failures.is_empty());
        let unique: HashSet<_> = result.ranked.iter().map(|c| c.params.clone()).collect();
        assert_eq!(unique.len(), 6);
        assert!(result.ranked.windows(2).all(|w| rank(&w[0], &w[1]) != Ordering::Greater));
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let run = |workers| {
            optimize(
                &template(),
                &small_space(),
                &search(
                    Search::Genetic {
                        population: 4,
                        generations: 3,
                        crossover_rate: 0.7,
                        mutation_rate: 0.3,
                        elite: 1,
                    },
                    workers,
                ),
                &view(),
                &BacktestConfig::default(),
                &StopSignal::new(),
            )
            .unwrap()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn random_and_annealing_stay_in_space() {
        let space = small_space();
        for algorithm in [
            Search::Random { samples: 10 },
            Search::Annealing {
                chains: 2,
                iterations: 4,
                initial_temperature: 0.05,
                cooling: 0.8,
            },
        ] {
            let r = optimize(
                &template(),
                &space,
                &search(algorithm, 2),
                &view(),
                &BacktestConfig::default(),
                &StopSignal::new(),
            )
            .unwrap();
            assert!(r.evaluated >= 1 && r.evaluated <= 6);
            assert!(r.ranked.iter().all(|c| space.validate(&c.params).is_ok()));
        }
    }

    #[test]
    fn infeasible_space_is_rejected() {
        let space = ParameterSpace::new(vec![
            ParamDim::integer("s", 5, 2),
            ParamDim::integer("l", 8, 9),
            ParamDim::integer("d", 3, 3),
        ]);
        let err = optimize(
            &template(),
            &space,
            &SearchConfig::default(),
            &view(),
            &BacktestConfig::default(),
            &StopSignal::new(),
        )
        .unwrap_err();
        assert!(matches!(err, QtsimError::EmptySearchSpace { .. }));
    }

    #[test]
    fn failing_candidates_are_recorded() {
        // the macd space itself requires s >= 2, so s = 1 fails on binding
        let space = ParameterSpace::new(vec![
            ParamDim::integer("s", 1, 2),
            ParamDim::integer("l", 8, 8),
            ParamDim::integer("d", 3, 3),
        ]);
        let r = optimize(
            &template(),
            &space,
            &search(Search::Grid { continuous_steps: 2 }, 2),
            &view(),
            &BacktestConfig::default(),
            &StopSignal::new(),
        )
        .unwrap();
        assert_eq!(r.evaluated, 2);
        assert_eq!(r.ranked.len(), 1);
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].params.values()[0], ParamValue::Int(1));
    }

    #[test]
    fn stopped_search_reports_cancellation() {
        let stop = StopSignal::new();
        stop.stop();
        let r = optimize(
            &template(),
            &small_space(),
            &search(Search::Grid { continuous_steps: 2 }, 2),
            &view(),
            &BacktestConfig::default(),
            &stop,
        )
        .unwrap();
        assert!(r.cancelled);
        assert_eq!(r.evaluated, 0);
    }

    #[test]
    fn ranking_puts_missing_scores_last() {
        let mk = |score, turnover, ordinal| Candidate {
            params: ParameterVector::empty(),
            score,
            metrics: Metrics {
                turnover,
                ..Default::default()
            },
            result: BacktestResult {
                instruments: vec![],
                holdings: vec![],
                trades: vec![],
                equity_curve: vec![],
                initial_capital: 1.0,
                total_fees: 0.0,
            },
            ordinal,
        };
        let mut v = vec![
            mk(None, Some(0.0), 0),
            mk(Some(0.1), Some(2.0), 1),
            mk(Some(0.1), Some(1.0), 2),
            mk(Some(0.3), None, 3),
            mk(Some(0.1), Some(1.0), 4),
        ];
        v.sort_by(rank);
        let order: Vec<usize> = v.iter().map(|c| c.ordinal).collect();
        assert_eq!(order, vec![3, 2, 4, 1, 0]);
    }

    #[test]
    fn search_config_validation() {
        let bad = SearchConfig {
            algorithm: Search::Genetic {
                population: 2,
                generations: 1,
                crossover_rate: 1.5,
                mutation_rate: 0.1,
                elite: 0,
            },
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(SearchConfig::default().validate().is_ok());
    }
}
