//! Strategy documents stored as JSON files.

use crate::domain::error::StagetraderError;
use crate::domain::strategy::document::StrategyDocument;
use crate::ports::strategy_port::StrategyPort;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Resolves relative sources against `base_dir`.
pub struct JsonStrategyAdapter {
    base_dir: PathBuf,
}

impl JsonStrategyAdapter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl Default for JsonStrategyAdapter {
    fn default() -> Self {
        Self::new(".")
    }
}

impl StrategyPort for JsonStrategyAdapter {
    fn load(&self, source: &str) -> Result<StrategyDocument, StagetraderError> {
        let path = self.base_dir.join(source);
        debug!(path = %path.display(), "loading strategy document");
        let text = fs::read_to_string(&path)?;
        StrategyDocument::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_document_relative_to_base() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("rsi.json"),
            r#"{"name": "rsi", "buyConditions": ["close > 1"]}"#,
        )
        .unwrap();
        let doc = JsonStrategyAdapter::new(dir.path()).load("rsi.json").unwrap();
        assert_eq!(doc.name, "rsi");
        assert_eq!(doc.buy_conditions.len(), 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = JsonStrategyAdapter::new(dir.path()).load("nope.json").unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn malformed_json_is_document_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.json"), "{\"name\": ").unwrap();
        let err = JsonStrategyAdapter::new(dir.path()).load("bad.json").unwrap_err();
        assert_eq!(err.kind(), "strategy_document");
    }
}
