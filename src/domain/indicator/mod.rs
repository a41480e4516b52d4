//! Technical indicators.
//!
//! - `spec`: tagged indicator declarations and their column names
//! - one module per built-in formula, each producing `Vec<Option<f64>>`
//!   columns aligned 1:1 with the input bars (`None` = undefined/warm-up)
//! - `cache`: the per-run arena that computes each column once
//! - [`ColumnArena`] / [`ColumnId`]: write-once column storage

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod cache;
pub mod cci;
pub mod ema;
pub mod ichimoku;
pub mod macd;
pub mod obv;
pub mod rsi;
pub mod sma;
pub mod spec;
pub mod stddev;
pub mod stochastic;
pub mod vwap;

pub use cache::{ColumnBindings, IndicatorCache, RunWarning};
pub use spec::{BuiltinKind, FormulaSpec, IndicatorKind, IndicatorSpec, OnError};

/// Stable handle to a column inside a [`ColumnArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(usize);

impl ColumnId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorColumn {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl IndicatorColumn {
    pub fn new(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Value at `row`; `None` for undefined rows and rows past the end.
    pub fn get(&self, row: usize) -> Option<f64> {
        self.values.get(row).copied().flatten()
    }
}

/// Append-only column storage. Columns are never mutated after insertion.
#[derive(Debug, Clone, Default)]
pub struct ColumnArena {
    columns: Vec<IndicatorColumn>,
}

impl ColumnArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: IndicatorColumn) -> ColumnId {
        self.columns.push(column);
        ColumnId(self.columns.len() - 1)
    }

    pub fn get(&self, id: ColumnId) -> &IndicatorColumn {
        &self.columns[id.0]
    }

    pub fn value(&self, id: ColumnId, row: usize) -> Option<f64> {
        self.columns.get(id.0).and_then(|c| c.get(row))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = ColumnArena::new();
        let a = arena.push(IndicatorColumn::new("a", vec![Some(1.0), None]));
        let b = arena.push(IndicatorColumn::new("b", vec![Some(2.0), Some(3.0)]));
        assert_ne!(a, b);
        assert_eq!(arena.get(a).name, "a");
        assert_eq!(arena.value(b, 1), Some(3.0));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn undefined_and_out_of_range_rows_are_none() {
        let mut arena = ColumnArena::new();
        let a = arena.push(IndicatorColumn::new("a", vec![Some(1.0), None]));
        assert_eq!(arena.value(a, 1), None);
        assert_eq!(arena.value(a, 5), None);
    }
}
