//! Market data source port trait.

use crate::domain::error::StagetraderError;
use crate::domain::ohlcv::Bar;
use chrono::NaiveDate;

pub trait DataPort {
    /// Bars for `instrument` in file order, limited to the inclusive date
    /// range when bounds are given. Ordering is checked by the series store,
    /// not here.
    fn fetch_bars(
        &self,
        instrument: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<Bar>, StagetraderError>;

    fn list_instruments(&self) -> Result<Vec<String>, StagetraderError>;
}
