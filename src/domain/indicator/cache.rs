//! Per-instrument indicator cache.
//!
//! Each distinct computation (by canonical key) runs at most once per
//! instrument, whether it is requested by one strategy or by many. Columns
//! live in a write-once [`ColumnArena`]; strategies see them through a
//! [`ColumnBindings`] map from output name to [`ColumnId`].

use super::{ColumnArena, ColumnId, IndicatorColumn, IndicatorKind, IndicatorSpec, OnError};
use crate::domain::error::{SandboxError, StagetraderError};
use crate::domain::sandbox::{FormulaExecutor, FormulaInput};
use crate::domain::series::InstrumentSeries;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A non-fatal problem recorded during a run, such as a disabled formula.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunWarning {
    pub instrument_id: String,
    pub indicator: String,
    pub kind: String,
    pub message: String,
}

/// Output column names visible to one strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBindings {
    columns: BTreeMap<String, ColumnId>,
}

impl ColumnBindings {
    pub fn get(&self, name: &str) -> Option<ColumnId> {
        self.columns.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, id: ColumnId) {
        self.columns.insert(name.into(), id);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Ready(Vec<ColumnId>),
    Failed(SandboxError),
}

pub struct IndicatorCache<'a> {
    series: &'a InstrumentSeries,
    executor: FormulaExecutor,
    arena: ColumnArena,
    entries: HashMap<String, CacheEntry>,
    computations: usize,
}

impl<'a> IndicatorCache<'a> {
    pub fn new(series: &'a InstrumentSeries, executor: FormulaExecutor) -> Self {
        Self {
            series,
            executor,
            arena: ColumnArena::new(),
            entries: HashMap::new(),
            computations: 0,
        }
    }

    pub fn series(&self) -> &'a InstrumentSeries {
        self.series
    }

    pub fn arena(&self) -> &ColumnArena {
        &self.arena
    }

    /// Number of indicator computations actually performed.
    pub fn computations(&self) -> usize {
        self.computations
    }

    fn store(&mut self, key: &str, columns: Vec<Vec<Option<f64>>>) -> Vec<ColumnId> {
        columns
            .into_iter()
            .enumerate()
            .map(|(i, values)| self.arena.push(IndicatorColumn::new(format!("{}[{}]", key, i), values)))
            .collect()
    }

    /// Returns the column ids for `spec`, computing them on first request.
    /// A failed formula stays failed for the rest of the run.
    pub fn ensure(&mut self, spec: &IndicatorSpec) -> Result<Vec<ColumnId>, SandboxError> {
        let key = spec.canonical_key();
        if let Some(entry) = self.entries.get(&key) {
            return match entry {
                CacheEntry::Ready(ids) => Ok(ids.clone()),
                CacheEntry::Failed(err) => Err(err.clone()),
            };
        }

        self.computations += 1;
        debug!(
            instrument = self.series.instrument_id(),
            key = %key,
            "computing indicator"
        );
        let entry = match &spec.kind {
            IndicatorKind::Builtin(kind) => {
                let columns = kind.compute(self.series.bars());
                CacheEntry::Ready(self.store(&key, columns))
            }
            IndicatorKind::Formula(formula) => {
                let input = FormulaInput::from_bars(self.series.bars());
                match self.executor.execute(formula, input) {
                    Ok(mut outputs) => {
                        let columns = formula
                            .outputs
                            .iter()
                            .map(|name| outputs.remove(name).unwrap_or_default())
                            .collect();
                        CacheEntry::Ready(self.store(&key, columns))
                    }
                    Err(err) => CacheEntry::Failed(err),
                }
            }
        };
        self.entries.insert(key, entry.clone());
        match entry {
            CacheEntry::Ready(ids) => Ok(ids),
            CacheEntry::Failed(err) => Err(err),
        }
    }

    fn disabled(&mut self, spec: &IndicatorSpec) -> Vec<ColumnId> {
        let key = format!("DISABLED:{}", spec.canonical_key());
        if let Some(CacheEntry::Ready(ids)) = self.entries.get(&key) {
            return ids.clone();
        }
        let rows = self.series.len();
        let columns = vec![vec![None; rows]; spec.output_names().len()];
        let ids = self.store(&key, columns);
        self.entries.insert(key, CacheEntry::Ready(ids.clone()));
        ids
    }

    /// Computes every indicator of a strategy and binds its output names.
    ///
    /// Formula failures follow the indicator's `onError` policy: `disable`
    /// binds all-undefined columns and records a warning, `abort` fails.
    pub fn bind(&mut self, indicators: &[IndicatorSpec]) -> Result<(ColumnBindings, Vec<RunWarning>), StagetraderError> {
        let mut bindings = ColumnBindings::default();
        let mut warnings = Vec::new();

        for spec in indicators {
            let ids = match self.ensure(spec) {
                Ok(ids) => ids,
                Err(err) => {
                    let on_error = match &spec.kind {
                        IndicatorKind::Formula(formula) => formula.on_error,
                        IndicatorKind::Builtin(_) => OnError::Abort,
                    };
                    if on_error == OnError::Abort {
                        return Err(StagetraderError::Sandbox {
                            indicator: spec.label(),
                            source: err,
                        });
                    }
                    warn!(
                        instrument = self.series.instrument_id(),
                        indicator = %spec.label(),
                        kind = err.kind(),
                        "formula indicator disabled: {}",
                        err
                    );
                    warnings.push(RunWarning {
                        instrument_id: self.series.instrument_id().to_string(),
                        indicator: spec.label(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                    self.disabled(spec)
                }
            };
            for (name, id) in spec.output_names().into_iter().zip(ids) {
                bindings.insert(name, id);
            }
        }
        Ok((bindings, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::{BuiltinKind, FormulaSpec};
    use crate::domain::ohlcv::Bar;
    use chrono::NaiveDate;

    fn series(n: usize) -> InstrumentSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let bars = (0..n)
            .map(|i| Bar {
                instrument_id: "ABC".into(),
                date: start + chrono::Duration::days(i as i64),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.0 + i as f64,
                volume: 1000,
            })
            .collect();
        InstrumentSeries::new("ABC", bars).unwrap()
    }

    fn sma(period: f64, alias: Option<&str>) -> IndicatorSpec {
        let params = [("period".to_string(), period)].into_iter().collect();
        IndicatorSpec {
            name: "sma".into(),
            alias: alias.map(String::from),
            kind: IndicatorKind::Builtin(BuiltinKind::parse("sma", &params, None).unwrap()),
        }
    }

    fn formula(body: &str, on_error: OnError) -> IndicatorSpec {
        IndicatorSpec {
            name: "custom".into(),
            alias: None,
            kind: IndicatorKind::Formula(FormulaSpec::new(
                body.into(),
                BTreeMap::new(),
                vec!["signal".into()],
                on_error,
            )),
        }
    }

    #[test]
    fn identical_requests_compute_once() {
        let s = series(10);
        let mut cache = IndicatorCache::new(&s, FormulaExecutor::default());
        let a = cache.ensure(&sma(3.0, None)).unwrap();
        let b = cache.ensure(&sma(3.0, Some("fast"))).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.computations(), 1);
        cache.ensure(&sma(5.0, None)).unwrap();
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn bind_exposes_output_names() {
        let s = series(10);
        let mut cache = IndicatorCache::new(&s, FormulaExecutor::default());
        let (bindings, warnings) = cache.bind(&[sma(3.0, None), sma(3.0, Some("fast"))]).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(bindings.get("sma_3"), bindings.get("fast"));
        let id = bindings.get("sma_3").unwrap();
        assert_eq!(cache.arena().value(id, 1), None);
        assert_eq!(cache.arena().value(id, 2), Some(11.0));
    }

    #[test]
    fn failing_formula_is_disabled_with_warning() {
        let s = series(5);
        let mut cache = IndicatorCache::new(&s, FormulaExecutor::default());
        let spec = formula("emit signal = missing", OnError::Disable);
        let (bindings, warnings) = cache.bind(&[spec]).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, "runtime");
        let id = bindings.get("signal").unwrap();
        assert!((0..5).all(|row| cache.arena().value(id, row).is_none()));
    }

    #[test]
    fn failing_formula_aborts_when_asked() {
        let s = series(5);
        let mut cache = IndicatorCache::new(&s, FormulaExecutor::default());
        let spec = formula("import os\nemit signal = close", OnError::Abort);
        let err = cache.bind(&[spec]).unwrap_err();
        assert!(matches!(err, StagetraderError::Sandbox { .. }));
    }

    #[test]
    fn failure_is_remembered() {
        let s = series(5);
        let mut cache = IndicatorCache::new(&s, FormulaExecutor::default());
        let spec = formula("emit signal = missing", OnError::Disable);
        assert!(cache.ensure(&spec).is_err());
        assert!(cache.ensure(&spec).is_err());
        assert_eq!(cache.computations(), 1);
    }
}
