//! Result sink port trait.

use crate::domain::backtest::BacktestResult;
use crate::domain::error::QtsimError;
use crate::domain::metrics::Metrics;
use crate::domain::optimizer::OptimizationResult;
use crate::domain::parameter::ParameterSpace;

/// Receives finished results for reporting or storage. Sinks only read.
pub trait ResultSink {
    /// Publish one backtest under `label`.
    fn publish_backtest(
        &self,
        label: &str,
        result: &BacktestResult,
        metrics: &Metrics,
    ) -> Result<(), QtsimError>;

    /// Publish a ranked optimization. `space` names the parameter columns.
    fn publish_optimization(
        &self,
        result: &OptimizationResult,
        space: &ParameterSpace,
    ) -> Result<(), QtsimError>;
}
