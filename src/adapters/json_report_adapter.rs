//! JSON report adapter implementing ReportPort, plus the plain-text summary
//! printed at the end of a run.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::domain::backtest::RunReport;
use crate::domain::error::StagetraderError;
use crate::ports::report_port::ReportPort;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReportAdapter {
    pub pretty: bool,
}

impl JsonReportAdapter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    pub fn render(&self, report: &RunReport) -> Result<String, StagetraderError> {
        let text = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        Ok(text)
    }
}

impl ReportPort for JsonReportAdapter {
    fn write(&self, report: &RunReport, output_path: &str) -> Result<(), StagetraderError> {
        let path = Path::new(output_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.render(report)?)?;
        info!(
            path = output_path,
            results = report.results.len(),
            errors = report.errors.len(),
            "report written"
        );
        Ok(())
    }
}

fn pct(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

/// One line per result and per failed job.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<24} {:>14} {:>10} {:>8} {:>10} {:>8}",
        "Instrument", "Strategy", "Final equity", "Return", "Sharpe", "Max DD", "Trades"
    );
    for result in &report.results {
        let _ = writeln!(
            out,
            "{:<12} {:<24} {:>14.2} {:>10} {:>8.2} {:>10} {:>8}",
            result.instrument_id,
            result.strategy_name,
            result.final_equity,
            pct(result.metrics.total_return),
            result.metrics.sharpe_ratio,
            pct(result.metrics.max_drawdown),
            result.trades.len()
        );
    }
    for error in &report.errors {
        let _ = writeln!(
            out,
            "{:<12} {:<24} FAILED ({}): {}",
            error.instrument_id, error.strategy_name, error.kind, error.message
        );
    }
    let warnings = report.warning_count();
    if warnings > 0 {
        let _ = writeln!(out, "{} indicator warning(s), see report for details", warnings);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::{BacktestResult, JobError};
    use crate::domain::indicator::RunWarning;
    use crate::domain::metrics::Metrics;
    use tempfile::TempDir;

    fn sample_report() -> RunReport {
        RunReport {
            results: vec![BacktestResult {
                instrument_id: "AAA".into(),
                strategy_name: "rsi".into(),
                initial_capital: 1000.0,
                final_equity: 1000.0,
                trades: Vec::new(),
                equity_curve: Vec::new(),
                metrics: Metrics::from_ledger(&[], &[], 1000.0, 0.0),
                warnings: vec![RunWarning {
                    instrument_id: "AAA".into(),
                    indicator: "spread".into(),
                    kind: "timeout".into(),
                    message: "formula exceeded the 10 ms time limit".into(),
                }],
            }],
            errors: vec![JobError {
                instrument_id: "BBB".into(),
                strategy_name: "rsi".into(),
                kind: "runtime".into(),
                message: "division by zero".into(),
            }],
        }
    }

    #[test]
    fn write_creates_parent_and_valid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.json");
        JsonReportAdapter::new(true)
            .write(&sample_report(), path.to_str().unwrap())
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"][0]["instrument_id"], "AAA");
        assert_eq!(value["results"][0]["warnings"][0]["kind"], "timeout");
        assert_eq!(value["errors"][0]["kind"], "runtime");
    }

    #[test]
    fn summary_lists_results_errors_and_warnings() {
        let summary = render_summary(&sample_report());
        assert!(summary.contains("AAA"));
        assert!(summary.contains("BBB"));
        assert!(summary.contains("FAILED (runtime)"));
        assert!(summary.contains("1 indicator warning(s)"));
    }
}
