//! CSV market data adapter: one `<INSTRUMENT>.csv` per instrument with the
//! header `date,open,high,low,close,volume`.

use crate::domain::error::StagetraderError;
use crate::domain::ohlcv::Bar;
use crate::ports::data_port::DataPort;
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const EXTENSION: &str = "csv";

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn csv_path(&self, instrument: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", instrument, EXTENSION))
    }
}

fn field<T: FromStr>(record: &csv::StringRecord, index: usize, name: &str, path: &Path, line: u64) -> Result<T, StagetraderError>
where
    T::Err: std::fmt::Display,
{
    let raw = record
        .get(index)
        .ok_or_else(|| StagetraderError::data(format!("{}:{}: missing {} column", path.display(), line, name)))?;
    raw.trim().parse().map_err(|e| {
        StagetraderError::data(format!(
            "{}:{}: invalid {} value '{}': {}",
            path.display(),
            line,
            name,
            raw,
            e
        ))
    })
}

impl DataPort for CsvAdapter {
    fn fetch_bars(
        &self,
        instrument: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<Bar>, StagetraderError> {
        let path = self.csv_path(instrument);
        if !path.exists() {
            return Err(StagetraderError::NoData {
                instrument: instrument.to_string(),
            });
        }
        let content = fs::read_to_string(&path)?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for result in rdr.records() {
            let record = result.map_err(|e| StagetraderError::data(format!("{}: CSV parse error: {}", path.display(), e)))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let date_str: String = field(&record, 0, "date", &path, line)?;
            let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").map_err(|e| {
                StagetraderError::data(format!("{}:{}: invalid date '{}': {}", path.display(), line, date_str, e))
            })?;

            if start_date.is_some_and(|start| date < start) || end_date.is_some_and(|end| date > end) {
                continue;
            }

            bars.push(Bar {
                instrument_id: instrument.to_string(),
                date,
                open: field(&record, 1, "open", &path, line)?,
                high: field(&record, 2, "high", &path, line)?,
                low: field(&record, 3, "low", &path, line)?,
                close: field(&record, 4, "close", &path, line)?,
                volume: field(&record, 5, "volume", &path, line)?,
            });
        }

        Ok(bars)
    }

    fn list_instruments(&self) -> Result<Vec<String>, StagetraderError> {
        let mut instruments = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                instruments.push(stem.to_string());
            }
        }
        instruments.sort();
        Ok(instruments)
    }
}
