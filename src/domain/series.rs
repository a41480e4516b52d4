//! In-memory series store: ordered, immutable bars per instrument.

use crate::domain::error::StagetraderError;
use crate::domain::ohlcv::{Bar, PriceField};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct InstrumentSeries {
    instrument_id: String,
    bars: Vec<Bar>,
    date_index: HashMap<NaiveDate, usize>,
}

impl InstrumentSeries {
    /// Builds a series, rejecting bars that are out of order, duplicated,
    /// or belong to a different instrument.
    pub fn new(instrument_id: impl Into<String>, bars: Vec<Bar>) -> Result<Self, StagetraderError> {
        let instrument_id = instrument_id.into();

        for (i, bar) in bars.iter().enumerate() {
            if bar.instrument_id != instrument_id {
                return Err(StagetraderError::Data {
                    reason: format!(
                        "bar {} belongs to {}, expected {}",
                        i, bar.instrument_id, instrument_id
                    ),
                });
            }
            if i > 0 && bar.date <= bars[i - 1].date {
                return Err(StagetraderError::Data {
                    reason: format!(
                        "{}: bars must be strictly ascending by date ({} follows {})",
                        instrument_id,
                        bar.date,
                        bars[i - 1].date
                    ),
                });
            }
        }

        let date_index = bars
            .iter()
            .enumerate()
            .map(|(i, bar)| (bar.date, i))
            .collect();

        Ok(Self {
            instrument_id,
            bars,
            date_index,
        })
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get_bar(&self, date: NaiveDate) -> Option<&Bar> {
        self.date_index.get(&date).map(|&i| &self.bars[i])
    }

    pub fn get_bar_index(&self, date: NaiveDate) -> Option<usize> {
        self.date_index.get(&date).copied()
    }

    /// Owned copy of one raw column.
    pub fn column(&self, field: PriceField) -> Vec<f64> {
        field.column(&self.bars)
    }
}

/// All loaded instruments, keyed by instrument id.
#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    series: BTreeMap<String, InstrumentSeries>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: InstrumentSeries) {
        self.series.insert(series.instrument_id.clone(), series);
    }

    pub fn get(&self, instrument_id: &str) -> Option<&InstrumentSeries> {
        self.series.get(instrument_id)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bar(id: &str, date: &str, close: f64) -> Bar {
        Bar {
            instrument_id: id.to_string(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn new_builds_date_index() {
        let bars = vec![
            make_bar("BHP", "2024-01-01", 100.0),
            make_bar("BHP", "2024-01-02", 101.0),
            make_bar("BHP", "2024-01-03", 102.0),
        ];
        let series = InstrumentSeries::new("BHP", bars).unwrap();

        assert_eq!(series.len(), 3);
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(series.get_bar_index(d), Some(1));
        assert_eq!(series.get_bar(d).unwrap().close, 101.0);
    }

    #[test]
    fn rejects_unordered_bars() {
        let bars = vec![
            make_bar("BHP", "2024-01-02", 100.0),
            make_bar("BHP", "2024-01-01", 101.0),
        ];
        let err = InstrumentSeries::new("BHP", bars).unwrap_err();
        assert!(matches!(err, StagetraderError::Data { .. }));
    }

    #[test]
    fn rejects_duplicate_dates() {
        let bars = vec![
            make_bar("BHP", "2024-01-01", 100.0),
            make_bar("BHP", "2024-01-01", 101.0),
        ];
        assert!(InstrumentSeries::new("BHP", bars).is_err());
    }

    #[test]
    fn rejects_foreign_instrument() {
        let bars = vec![make_bar("CBA", "2024-01-01", 100.0)];
        assert!(InstrumentSeries::new("BHP", bars).is_err());
    }

    #[test]
    fn column_copies_field() {
        let bars = vec![
            make_bar("BHP", "2024-01-01", 100.0),
            make_bar("BHP", "2024-01-02", 105.0),
        ];
        let series = InstrumentSeries::new("BHP", bars).unwrap();
        assert_eq!(series.column(PriceField::Close), vec![100.0, 105.0]);
        assert_eq!(series.column(PriceField::High), vec![101.0, 106.0]);
    }

    #[test]
    fn store_lists_instruments_sorted() {
        let mut store = SeriesStore::new();
        store.insert(InstrumentSeries::new("CBA", vec![make_bar("CBA", "2024-01-01", 1.0)]).unwrap());
        store.insert(InstrumentSeries::new("BHP", vec![make_bar("BHP", "2024-01-01", 1.0)]).unwrap());
        let ids: Vec<&str> = store.instruments().collect();
        assert_eq!(ids, vec!["BHP", "CBA"]);
        assert!(store.get("CBA").is_some());
        assert!(store.get("XYZ").is_none());
    }
}
