//! CLI definition and dispatch.

use clap::{ArgAction, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_report_adapter::{JsonReportAdapter, render_summary};
use crate::adapters::json_strategy_adapter::JsonStrategyAdapter;
use crate::domain::backtest::{BatchJob, RunReport, run_batch};
use crate::domain::config_validation::{
    RunConfig, check_formulas, validate_run_config, validate_sandbox_limits,
};
use crate::domain::error::{SandboxError, StagetraderError};
use crate::domain::sandbox::ast::{Stmt, StmtKind};
use crate::domain::sandbox::{FormulaExecutor, SandboxLimits};
use crate::domain::strategy::Strategy;
use crate::domain::universe::{SkippedInstrument, load_universe, parse_instruments};
use crate::ports::data_port::DataPort;
use crate::ports::report_port::ReportPort;
use crate::ports::strategy_port::StrategyPort;

#[derive(Parser, Debug)]
#[command(name = "stagetrader", about = "Staged-entry strategy backtester")]
pub struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides [backtest] strategy
        #[arg(short, long)]
        strategy: Option<PathBuf>,
        /// Overrides [report] output
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overrides [backtest] instruments
        #[arg(long)]
        instruments: Option<String>,
        /// Validate and load data without simulating
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a run configuration and/or a strategy document
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        strategy: Option<PathBuf>,
    },
    /// Statically check a formula body without running it
    CheckFormula {
        file: PathBuf,
        /// Read sandbox limits from this run configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Default tracing filter directive for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Backtest {
            config,
            strategy,
            output,
            instruments,
            dry_run,
        } => run_backtest_command(&config, strategy, output, instruments.as_deref(), dry_run),
        Command::Validate { config, strategy } => run_validate(config.as_deref(), strategy.as_deref()),
        Command::CheckFormula { file, config } => run_check_formula(&file, config.as_deref()),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!(kind = e.kind(), "{e}");
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Reads and validates a run configuration. Relative paths inside it are
/// resolved against the configuration file's directory.
pub fn load_run_config(config_path: &Path) -> Result<RunConfig, StagetraderError> {
    info!(path = %config_path.display(), "loading config");
    let adapter = FileConfigAdapter::from_file(config_path)?;
    let mut run = validate_run_config(&adapter)?;
    let base = config_dir(config_path);
    run.data_dir = base.join(&run.data_dir);
    run.strategy_path = base.join(&run.strategy_path);
    run.output = run.output.map(|output| base.join(output));
    Ok(run)
}

pub fn load_strategy(store: &dyn StrategyPort, source: &Path) -> Result<Strategy, StagetraderError> {
    let doc = store.load(&source.to_string_lossy())?;
    let strategy = Strategy::from_document(&doc)?;
    info!(
        strategy = %strategy.name,
        indicators = strategy.indicators.len(),
        buy_stages = strategy.buy_stages.len(),
        sell_stages = strategy.sell_stages.len(),
        "strategy loaded"
    );
    Ok(strategy)
}

/// Output of a completed run.
#[derive(Debug)]
pub struct BacktestRun {
    pub report: RunReport,
    pub skipped: Vec<SkippedInstrument>,
    /// Exit status of the first failed job, if any job failed.
    pub failure_code: Option<u8>,
}

/// Loads the universe and simulates `strategy` on every instrument.
pub fn execute_backtest(
    run: &RunConfig,
    strategy: &Strategy,
    data_port: &dyn DataPort,
) -> Result<BacktestRun, StagetraderError> {
    let universe = load_universe(
        data_port,
        &run.instruments,
        run.backtest.start_date,
        run.backtest.end_date,
    )?;

    let strategies = std::slice::from_ref(strategy);
    let jobs: Vec<BatchJob<'_>> = universe
        .series
        .iter()
        .map(|series| BatchJob { series, strategies })
        .collect();
    let outcomes = run_batch(&jobs, &run.backtest)?;

    let failure_code = outcomes
        .iter()
        .find_map(|o| o.result.as_ref().err())
        .map(StagetraderError::exit_code);
    Ok(BacktestRun {
        report: RunReport::from_outcomes(outcomes),
        skipped: universe.skipped,
        failure_code,
    })
}

fn run_backtest_command(
    config_path: &Path,
    strategy_override: Option<PathBuf>,
    output_override: Option<PathBuf>,
    instruments_override: Option<&str>,
    dry_run: bool,
) -> Result<ExitCode, StagetraderError> {
    let mut run = load_run_config(config_path)?;
    if let Some(path) = strategy_override {
        run.strategy_path = path;
    }
    if let Some(path) = output_override {
        run.output = Some(path);
    }
    if let Some(list) = instruments_override {
        run.instruments = parse_instruments(list)?;
    }

    let strategy = load_strategy(&JsonStrategyAdapter::default(), &run.strategy_path)?;
    let executor = FormulaExecutor::new(run.backtest.sandbox);
    for (indicator, rejection) in check_formulas(&strategy, &executor) {
        warn!(indicator = %indicator, kind = rejection.kind(), "{rejection}");
    }

    let data_port = CsvAdapter::new(&run.data_dir);
    if dry_run {
        let universe = load_universe(
            &data_port,
            &run.instruments,
            run.backtest.start_date,
            run.backtest.end_date,
        )?;
        println!(
            "dry run: strategy '{}' on {} instrument(s), {} skipped",
            strategy.name,
            universe.count(),
            universe.skipped.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = execute_backtest(&run, &strategy, &data_port)?;
    for skipped in &outcome.skipped {
        println!("skipped {}: {:?}", skipped.instrument_id, skipped.reason);
    }
    print!("{}", render_summary(&outcome.report));

    if let Some(path) = &run.output {
        JsonReportAdapter::new(true).write(&outcome.report, &path.to_string_lossy())?;
        println!("report written to {}", path.display());
    }

    Ok(match outcome.failure_code {
        Some(code) => ExitCode::from(code),
        None => ExitCode::SUCCESS,
    })
}

/// Checks a strategy's formulas; the first rejection becomes the error.
pub fn validate_strategy(strategy: &Strategy, limits: SandboxLimits) -> Result<(), StagetraderError> {
    let executor = FormulaExecutor::new(limits);
    let mut issues = check_formulas(strategy, &executor);
    for (indicator, rejection) in &issues {
        eprintln!("formula '{indicator}': {rejection}");
    }
    if issues.is_empty() {
        Ok(())
    } else {
        let (indicator, source) = issues.swap_remove(0);
        Err(StagetraderError::Sandbox { indicator, source })
    }
}

fn run_validate(config_path: Option<&Path>, strategy_path: Option<&Path>) -> Result<ExitCode, StagetraderError> {
    let run = config_path.map(load_run_config).transpose()?;
    if let Some(path) = config_path {
        println!("config ok: {}", path.display());
    }

    let strategy_path = match (strategy_path, &run) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(run)) => run.strategy_path.clone(),
        (None, None) => {
            return Err(StagetraderError::config(
                "validate",
                "pass --config, --strategy, or both",
            ));
        }
    };
    let limits = run.map(|r| r.backtest.sandbox).unwrap_or_default();

    let strategy = load_strategy(&JsonStrategyAdapter::default(), &strategy_path)?;
    validate_strategy(&strategy, limits)?;
    println!(
        "strategy ok: '{}' ({} buy stage(s), {} sell stage(s))",
        strategy.name,
        strategy.buy_stages.len(),
        strategy.sell_stages.len()
    );
    Ok(ExitCode::SUCCESS)
}

/// Names assigned by `emit`, in order of first appearance.
pub fn emitted_names(stmts: &[Stmt]) -> Vec<String> {
    let mut names = Vec::new();
    collect_emits(stmts, &mut names);
    names
}

fn collect_emits(stmts: &[Stmt], names: &mut Vec<String>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Emit { target, .. } if !names.contains(target) => names.push(target.clone()),
            StmtKind::For { body, .. } => collect_emits(body, names),
            _ => {}
        }
    }
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, position: usize) -> (usize, usize) {
    let before = source.get(..position).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

/// Parses and validates one formula body against `limits`.
pub fn check_formula_source(body: &str, limits: SandboxLimits) -> Result<Vec<String>, SandboxError> {
    let program = FormulaExecutor::new(limits).check(body)?;
    Ok(emitted_names(&program.stmts))
}

fn run_check_formula(file: &Path, config_path: Option<&Path>) -> Result<ExitCode, StagetraderError> {
    let limits = match config_path {
        Some(path) => validate_sandbox_limits(&FileConfigAdapter::from_file(path)?)?,
        None => SandboxLimits::default(),
    };
    let body = fs::read_to_string(file)?;
    match check_formula_source(&body, limits) {
        Ok(outputs) => {
            println!("formula ok: emits {}", outputs.join(", "));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if let SandboxError::Rejected { position, .. } = &e {
                let (line, column) = line_col(&body, *position);
                eprintln!("{}:{}:{}", file.display(), line, column);
            }
            Err(StagetraderError::Sandbox {
                indicator: file.display().to_string(),
                source: e,
            })
        }
    }
}
