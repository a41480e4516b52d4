//! Reporting sink port trait.

use crate::domain::backtest::RunReport;
use crate::domain::error::StagetraderError;

/// Port for writing the output of a run.
pub trait ReportPort {
    fn write(&self, report: &RunReport, output_path: &str) -> Result<(), StagetraderError>;
}
