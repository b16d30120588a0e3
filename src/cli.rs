//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

use crate::adapters::csv_adapter::CsvDataProvider;
use crate::adapters::csv_report_adapter::CsvResultSink;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestConfig, BacktestResult, run_backtest};
use crate::domain::config_validation::{self, DataRequest};
use crate::domain::error::QtsimError;
use crate::domain::history::{HALTED_FIELD, HistoryView};
use crate::domain::metrics::Metrics;
use crate::domain::operator::Operator;
use crate::domain::optimizer::{OptimizationResult, SearchConfig, StopSignal, optimize};
use crate::domain::parameter::ParameterSpace;
use crate::domain::registry::StrategyRegistry;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::{DataProvider, load_history_with_optional};
use crate::ports::report_port::ResultSink;

const DEFAULT_DATA_DIR: &str = "data";

#[derive(Parser, Debug)]
#[command(name = "qtsim", about = "Strategy backtester and parameter optimizer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory for result CSV files
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
        #[arg(long, default_value = "backtest")]
        label: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Search the operator's parameter space
    Optimize {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
        /// Candidates printed to the console
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Validate a configuration file without loading data
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List built-in strategies
    Strategies,
    /// List instruments available in the configured data directory
    Instruments {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            output,
            label,
            dry_run,
        } => {
            if dry_run {
                run_dry_run(&config)
            } else {
                report(run_backtest_command(&config, &output, &label))
            }
        }
        Command::Optimize {
            config,
            output,
            top,
        } => report(run_optimize_command(&config, &output, top)),
        Command::Validate { config } => report(validate(&config)),
        Command::Strategies => {
            print_strategies(&StrategyRegistry::new());
            ExitCode::SUCCESS
        }
        Command::Instruments { config } => report(list_instruments(&config)),
    }
}

fn report(outcome: Result<(), QtsimError>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Everything a run needs from the configuration file.
#[derive(Debug, Clone)]
pub struct Session {
    pub backtest: BacktestConfig,
    pub operator: Operator,
    pub data: DataRequest,
    pub data_dir: PathBuf,
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, QtsimError> {
    FileConfigAdapter::from_file(path)
}

/// Assemble a session. Relative data paths resolve against `base_dir`.
pub fn build_session(config: &dyn ConfigPort, base_dir: &Path) -> Result<Session, QtsimError> {
    let registry = StrategyRegistry::new();
    let backtest = config_validation::backtest_config(config)?;
    let operator = config_validation::operator(config, &registry)?;
    let data = config_validation::data_request(config)?;
    let source = PathBuf::from(data.source.as_deref().unwrap_or(DEFAULT_DATA_DIR));
    let data_dir = if source.is_absolute() {
        source
    } else {
        base_dir.join(source)
    };
    Ok(Session {
        backtest,
        operator,
        data,
        data_dir,
    })
}

fn session_from_file(config_path: &Path) -> Result<(FileConfigAdapter, Session), QtsimError> {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = load_config(config_path)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let session = build_session(&adapter, base_dir)?;
    Ok((adapter, session))
}

/// Load every field the operator and the price column need for the
/// configured instruments and date range, plus the halt flag when the
/// provider has one.
pub fn load_view(provider: &dyn DataProvider, session: &Session) -> Result<HistoryView, QtsimError> {
    let mut fields: Vec<&str> = session.operator.required_fields();
    if !fields.contains(&session.backtest.price_field.as_str()) {
        fields.push(&session.backtest.price_field);
    }
    let start = session.backtest.start_date.unwrap_or(NaiveDate::MIN);
    let end = session.backtest.end_date.unwrap_or(NaiveDate::MAX);
    let cube = load_history_with_optional(
        provider,
        &fields,
        &[HALTED_FIELD],
        &session.data.instruments,
        start,
        end,
    )?;
    if cube.dates().is_empty() {
        return Err(QtsimError::Provider {
            reason: format!(
                "no data for {} between {start} and {end}",
                session.data.instruments.join(", ")
            ),
        });
    }
    info!(
        instruments = cube.instruments().len(),
        dates = cube.dates().len(),
        fields = fields.len(),
        "history loaded"
    );
    Ok(HistoryView::new(cube, session.data.fill))
}

fn run_backtest_command(config_path: &Path, output: &Path, label: &str) -> Result<(), QtsimError> {
    let (_, session) = session_from_file(config_path)?;
    let provider = CsvDataProvider::new(session.data_dir.clone());
    let sink = CsvResultSink::new(output.to_path_buf());
    run_backtest_pipeline(&provider, &session, &sink, label)?;
    eprintln!("\nResults written to: {}", output.display());
    Ok(())
}

pub fn run_backtest_pipeline(
    provider: &dyn DataProvider,
    session: &Session,
    sink: &dyn ResultSink,
    label: &str,
) -> Result<(BacktestResult, Metrics), QtsimError> {
    let view = load_view(provider, session)?;
    eprintln!(
        "Running backtest: {} instruments, {} dates",
        view.cube().instruments().len(),
        view.cube().dates().len()
    );
    let result = run_backtest(&session.operator, &view, &session.backtest)?;
    let metrics = Metrics::evaluate(&result, session.backtest.risk_free_rate);
    print_summary(&result, &metrics);
    sink.publish_backtest(label, &result, &metrics)?;
    Ok((result, metrics))
}

fn run_optimize_command(config_path: &Path, output: &Path, top: usize) -> Result<(), QtsimError> {
    let (adapter, session) = session_from_file(config_path)?;
    let search = config_validation::search_config(&adapter)?;
    let space = config_validation::search_space(&adapter, &session.operator)?;
    let provider = CsvDataProvider::new(session.data_dir.clone());
    let sink = CsvResultSink::new(output.to_path_buf());
    let result = run_optimize_pipeline(&provider, &session, &space, &search, &sink, &StopSignal::new())?;
    print_ranking(&result, top);
    eprintln!("\nResults written to: {}", output.display());
    Ok(())
}

pub fn run_optimize_pipeline(
    provider: &dyn DataProvider,
    session: &Session,
    space: &ParameterSpace,
    search: &SearchConfig,
    sink: &dyn ResultSink,
    stop: &StopSignal,
) -> Result<OptimizationResult, QtsimError> {
    let view = load_view(provider, session)?;
    eprintln!(
        "Optimizing {} parameters with {:?} on {} workers",
        space.len(),
        search.algorithm,
        search.workers
    );
    let result = optimize(&session.operator, space, search, &view, &session.backtest, stop)?;
    sink.publish_optimization(&result, space)?;
    Ok(result)
}

pub fn run_dry_run(config_path: &Path) -> ExitCode {
    match session_from_file(config_path) {
        Ok((_, session)) => {
            describe_session(&session);
            eprintln!("\nDry run complete: configuration is valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Check every section, including `[optimize]` when present.
pub fn validate(config_path: &Path) -> Result<(), QtsimError> {
    let (adapter, session) = session_from_file(config_path)?;
    describe_session(&session);
    if adapter.has_section("optimize") {
        let search = config_validation::search_config(&adapter)?;
        eprintln!("\nSearch: {:?}", search.algorithm);
        eprintln!("  metric:  {}", search.metric);
        eprintln!("  seed:    {}", search.seed);
        eprintln!("  workers: {}", search.workers);
        let space = config_validation::search_space(&adapter, &session.operator)?;
        eprintln!("  space:   {} dimensions", space.len());
        for dim in space.dims() {
            eprintln!("    {:<32} {:?}", dim.name, dim.kind);
        }
    }
    eprintln!("\nConfig validated successfully");
    Ok(())
}

fn list_instruments(config_path: &Path) -> Result<(), QtsimError> {
    let (_, session) = session_from_file(config_path)?;
    let provider = CsvDataProvider::new(session.data_dir.clone());
    let instruments = provider.list_instruments()?;
    for instrument in &instruments {
        println!("{instrument}");
    }
    eprintln!("{} instruments found in {}", instruments.len(), session.data_dir.display());
    Ok(())
}

fn describe_session(session: &Session) {
    eprintln!("\nStrategies:");
    for strategy in session.operator.strategies() {
        eprintln!(
            "  {:<10} {}({})",
            strategy.role().to_string(),
            strategy.kind(),
            strategy.params()
        );
    }
    eprintln!("\nFields: {}", session.operator.required_fields().join(", "));
    eprintln!("\nUniverse:");
    eprintln!("  instruments: {}", session.data.instruments.join(", "));
    eprintln!("  data:        {}", session.data_dir.display());
    let bt = &session.backtest;
    eprintln!("\nBacktest:");
    eprintln!("  capital:   {:.2}", bt.initial_capital);
    eprintln!("  rebalance: {:?}", bt.rebalance);
    eprintln!("  price:     {}", bt.price_field);
    if let Some(start) = bt.start_date {
        eprintln!("  start:     {start}");
    }
    if let Some(end) = bt.end_date {
        eprintln!("  end:       {end}");
    }
}

fn pct(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}%", x * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn ratio(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "n/a".to_string())
}

fn print_summary(result: &BacktestResult, metrics: &Metrics) {
    eprintln!("\n=== Results ===");
    eprintln!("Final Equity:     {}", ratio(result.final_equity()));
    eprintln!("Total Return:     {}", pct(metrics.total_return));
    eprintln!("Annualized:       {}", pct(metrics.annualized_return));
    eprintln!("Sharpe Ratio:     {}", ratio(metrics.sharpe_ratio));
    eprintln!("Sortino Ratio:    {}", ratio(metrics.sortino_ratio));
    eprintln!("Max Drawdown:     {}", pct(metrics.max_drawdown));
    eprintln!("Total Trades:     {}", metrics.trade_count);
    eprintln!("Win Rate:         {}", pct(metrics.win_rate));
    eprintln!("Total Fees:       {:.2}", metrics.total_fees);
}

fn print_ranking(result: &OptimizationResult, top: usize) {
    eprintln!(
        "\n=== Optimization: {} evaluated, {} failed{} ===",
        result.evaluated,
        result.failures.len(),
        if result.cancelled { ", cancelled" } else { "" }
    );
    for (rank, candidate) in result.ranked.iter().take(top).enumerate() {
        eprintln!(
            "  {:>3}. score {:>10}  [{}]",
            rank + 1,
            ratio(candidate.score),
            candidate.params
        );
    }
}

pub fn print_strategies(registry: &StrategyRegistry) {
    for id in registry.identifiers() {
        let Ok(kind) = registry.kind(id) else {
            continue;
        };
        let space = kind.parameter_space();
        let dims: Vec<&str> = space.dims().iter().map(|d| d.name.as_str()).collect();
        println!(
            "{:<12} {:<10} ({}) {}",
            id,
            kind.role().to_string(),
            dims.join(", "),
            kind.description()
        );
    }
}
