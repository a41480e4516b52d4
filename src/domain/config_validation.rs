//! Run-configuration validation.
//!
//! Every key is checked before any data is loaded; the result is a typed
//! [`RunConfig`] so later stages never re-read the INI.

use crate::domain::backtest::BacktestConfig;
use crate::domain::error::{SandboxError, StagetraderError};
use crate::domain::indicator::IndicatorKind;
use crate::domain::sandbox::{
    DEFAULT_MAX_SOURCE_BYTES, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIMEOUT_MS, FormulaExecutor, SandboxLimits,
};
use crate::domain::strategy::Strategy;
use crate::domain::universe::parse_instruments;
use crate::ports::config_port::ConfigPort;
use chrono::NaiveDate;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub data_dir: PathBuf,
    pub instruments: Vec<String>,
    pub strategy_path: PathBuf,
    pub output: Option<PathBuf>,
    pub backtest: BacktestConfig,
}

pub fn validate_run_config(config: &dyn ConfigPort) -> Result<RunConfig, StagetraderError> {
    let data_dir = required(config, "backtest", "data_dir")?;
    let instruments = parse_instruments(&required(config, "backtest", "instruments")?)?;
    let strategy_path = required(config, "backtest", "strategy")?;
    let (start_date, end_date) = validate_dates(config)?;
    let risk_free_rate = validate_risk_free_rate(config)?;

    let threads: i64 = number(config, "backtest", "threads", 0)?;
    if threads < 0 {
        return Err(invalid("backtest", "threads", "threads must be non-negative"));
    }

    let output = config
        .get_string("report", "output")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);

    Ok(RunConfig {
        data_dir: PathBuf::from(data_dir),
        instruments,
        strategy_path: PathBuf::from(strategy_path),
        output,
        backtest: BacktestConfig {
            start_date,
            end_date,
            risk_free_rate,
            threads: threads as usize,
            sandbox: validate_sandbox_limits(config)?,
        },
    })
}

/// Reads the `[sandbox]` section, falling back to the defaults.
pub fn validate_sandbox_limits(config: &dyn ConfigPort) -> Result<SandboxLimits, StagetraderError> {
    let timeout_ms: u64 = number(config, "sandbox", "timeout_ms", DEFAULT_TIMEOUT_MS)?;
    let memory_limit_mb: usize = number(config, "sandbox", "memory_limit_mb", DEFAULT_MEMORY_LIMIT_MB)?;
    let max_source_bytes: usize = number(config, "sandbox", "max_source_bytes", DEFAULT_MAX_SOURCE_BYTES)?;

    for (key, value) in [
        ("timeout_ms", timeout_ms as usize),
        ("memory_limit_mb", memory_limit_mb),
        ("max_source_bytes", max_source_bytes),
    ] {
        if value == 0 {
            return Err(invalid("sandbox", key, format!("{} must be positive", key)));
        }
    }

    Ok(SandboxLimits {
        timeout: Duration::from_millis(timeout_ms),
        memory_limit_bytes: memory_limit_mb.saturating_mul(1024 * 1024),
        max_source_bytes,
    })
}

/// Statically checks every formula indicator of `strategy` without running
/// it, returning the label and rejection of each formula that fails.
pub fn check_formulas(strategy: &Strategy, executor: &FormulaExecutor) -> Vec<(String, SandboxError)> {
    strategy
        .indicators
        .iter()
        .filter_map(|spec| match &spec.kind {
            IndicatorKind::Formula(formula) => executor
                .check(&formula.body)
                .err()
                .map(|err| (spec.label(), err)),
            IndicatorKind::Builtin(_) => None,
        })
        .collect()
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> StagetraderError {
    StagetraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn required(config: &dyn ConfigPort, section: &str, key: &str) -> Result<String, StagetraderError> {
    match config.get_string(section, key) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(StagetraderError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Parses an optional numeric key; a present but malformed value is an error
/// rather than a silent default.
fn number<T: FromStr>(config: &dyn ConfigPort, section: &str, key: &str, default: T) -> Result<T, StagetraderError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(section, key, format!("'{}' is not a valid number", raw.trim()))),
    }
}

fn validate_risk_free_rate(config: &dyn ConfigPort) -> Result<f64, StagetraderError> {
    let value: f64 = number(config, "backtest", "risk_free_rate", 0.0)?;
    if !(0.0..1.0).contains(&value) {
        return Err(invalid(
            "backtest",
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }
    Ok(value)
}

fn validate_dates(config: &dyn ConfigPort) -> Result<(Option<NaiveDate>, Option<NaiveDate>), StagetraderError> {
    let start_date = parse_date(config.get_string("backtest", "start_date").as_deref(), "start_date")?;
    let end_date = parse_date(config.get_string("backtest", "end_date").as_deref(), "end_date")?;

    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start >= end {
            return Err(invalid("backtest", "start_date", "start_date must be before end_date"));
        }
    }
    Ok((start_date, end_date))
}

fn parse_date(value: Option<&str>, field: &str) -> Result<Option<NaiveDate>, StagetraderError> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| invalid("backtest", field, format!("invalid {} format, expected YYYY-MM-DD", field))),
    }
}
