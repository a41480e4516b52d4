//! Instrument universe: parses instrument lists from configuration and loads
//! a series for each instrument that has enough data to simulate.

use crate::domain::error::StagetraderError;
use crate::domain::series::InstrumentSeries;
use crate::ports::data_port::DataPort;
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{info, warn};

/// One row to enter on and one to exit on.
pub const MIN_BARS: usize = 2;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UniverseError {
    #[error("empty token in instrument list")]
    EmptyToken,

    #[error("duplicate instrument: {0}")]
    DuplicateInstrument(String),
}

impl From<UniverseError> for StagetraderError {
    fn from(err: UniverseError) -> Self {
        StagetraderError::ConfigInvalid {
            section: "backtest".to_string(),
            key: "instruments".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Splits a comma-separated list, trimming and upper-casing each entry.
pub fn parse_instruments(input: &str) -> Result<Vec<String>, UniverseError> {
    let mut instruments = Vec::new();
    let mut seen = HashSet::new();

    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(UniverseError::EmptyToken);
        }
        let instrument = trimmed.to_uppercase();
        if !seen.insert(instrument.clone()) {
            return Err(UniverseError::DuplicateInstrument(instrument));
        }
        instruments.push(instrument);
    }

    Ok(instruments)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoData,
    InsufficientBars { bars: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedInstrument {
    pub instrument_id: String,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct Universe {
    pub series: Vec<InstrumentSeries>,
    pub skipped: Vec<SkippedInstrument>,
}

impl Universe {
    pub fn count(&self) -> usize {
        self.series.len()
    }
}

/// Fetches and validates a series per instrument.
///
/// Instruments without data or with fewer than [`MIN_BARS`] bars are skipped
/// with a warning. Malformed or out-of-order data is an error, not a skip.
/// Fails when nothing is left to simulate.
pub fn load_universe(
    data_port: &dyn DataPort,
    instruments: &[String],
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<Universe, StagetraderError> {
    let mut series = Vec::new();
    let mut skipped = Vec::new();

    for instrument in instruments {
        let bars = match data_port.fetch_bars(instrument, start_date, end_date) {
            Ok(bars) => bars,
            Err(StagetraderError::NoData { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };

        if bars.is_empty() {
            warn!(instrument = %instrument, "skipping instrument: no data");
            skipped.push(SkippedInstrument {
                instrument_id: instrument.clone(),
                reason: SkipReason::NoData,
            });
            continue;
        }

        if bars.len() < MIN_BARS {
            warn!(
                instrument = %instrument,
                bars = bars.len(),
                minimum = MIN_BARS,
                "skipping instrument: insufficient bars"
            );
            skipped.push(SkippedInstrument {
                instrument_id: instrument.clone(),
                reason: SkipReason::InsufficientBars { bars: bars.len() },
            });
            continue;
        }

        info!(instrument = %instrument, bars = bars.len(), "loaded series");
        series.push(InstrumentSeries::new(instrument.clone(), bars)?);
    }

    if series.is_empty() {
        return Err(StagetraderError::InsufficientData {
            instrument: "all".to_string(),
            bars: 0,
            minimum: MIN_BARS,
        });
    }

    Ok(Universe { series, skipped })
}
