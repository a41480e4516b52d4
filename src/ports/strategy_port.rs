//! Strategy store port trait.

use crate::domain::error::StagetraderError;
use crate::domain::strategy::document::StrategyDocument;

pub trait StrategyPort {
    /// Loads the raw document named by `source` (a path for file stores).
    fn load(&self, source: &str) -> Result<StrategyDocument, StagetraderError>;
}
