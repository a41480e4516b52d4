#![allow(dead_code)]

use chrono::NaiveDate;
use stagetrader::domain::error::StagetraderError;
use stagetrader::domain::indicator::IndicatorCache;
pub use stagetrader::domain::ohlcv::Bar;
use stagetrader::domain::backtest::{BacktestConfig, BacktestResult, run_backtest};
use stagetrader::domain::sandbox::FormulaExecutor;
use stagetrader::domain::series::InstrumentSeries;
use stagetrader::domain::strategy::Strategy;
use stagetrader::domain::strategy::document::StrategyDocument;
use stagetrader::ports::data_port::DataPort;
use std::collections::HashMap;

pub struct MockDataPort {
    pub data: HashMap<String, Vec<Bar>>,
    pub errors: HashMap<String, String>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, instrument: &str, bars: Vec<Bar>) -> Self {
        self.data.insert(instrument.to_string(), bars);
        self
    }

    pub fn with_error(mut self, instrument: &str, reason: &str) -> Self {
        self.errors.insert(instrument.to_string(), reason.to_string());
        self
    }
}

impl DataPort for MockDataPort {
    fn fetch_bars(
        &self,
        instrument: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<Bar>, StagetraderError> {
        if let Some(reason) = self.errors.get(instrument) {
            return Err(StagetraderError::data(reason.clone()));
        }
        let bars = self.data.get(instrument).ok_or_else(|| StagetraderError::NoData {
            instrument: instrument.to_string(),
        })?;
        Ok(bars
            .iter()
            .filter(|b| start_date.is_none_or(|s| b.date >= s) && end_date.is_none_or(|e| b.date <= e))
            .cloned()
            .collect())
    }

    fn list_instruments(&self) -> Result<Vec<String>, StagetraderError> {
        let mut instruments: Vec<String> = self.data.keys().cloned().collect();
        instruments.sort();
        Ok(instruments)
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One bar per calendar day from 2024-01-01, open = high = low = close.
pub fn make_bars(instrument: &str, closes: &[f64]) -> Vec<Bar> {
    let start = date(2024, 1, 1);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            instrument_id: instrument.to_string(),
            date: start + chrono::Duration::days(i as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10_000,
        })
        .collect()
}

/// Bars with a fixed intraday range around each close.
pub fn make_ranged_bars(instrument: &str, closes: &[f64], range: f64) -> Vec<Bar> {
    make_bars(instrument, closes)
        .into_iter()
        .map(|mut bar| {
            bar.high = bar.close + range / 2.0;
            bar.low = bar.close - range / 2.0;
            bar
        })
        .collect()
}

pub fn make_series(instrument: &str, closes: &[f64]) -> InstrumentSeries {
    InstrumentSeries::new(instrument, make_bars(instrument, closes)).unwrap()
}

/// `start` moving by `step` for `count` rows, starting with `start` itself.
pub fn ramp(start: f64, step: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| start + step * i as f64).collect()
}

pub fn strategy(json: &str) -> Strategy {
    Strategy::from_document(&StrategyDocument::from_json(json).unwrap()).unwrap()
}

pub fn backtest(strategy: &Strategy, series: &InstrumentSeries) -> Result<BacktestResult, StagetraderError> {
    backtest_with(strategy, series, &BacktestConfig::default())
}

pub fn backtest_with(
    strategy: &Strategy,
    series: &InstrumentSeries,
    config: &BacktestConfig,
) -> Result<BacktestResult, StagetraderError> {
    let mut cache = IndicatorCache::new(series, FormulaExecutor::new(config.sandbox));
    run_backtest(strategy, &mut cache, config)
}
