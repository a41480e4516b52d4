//! Sandboxed execution of user formula indicators.
//!
//! A formula body goes through three gates: [`parser::parse`], the static
//! allow-list in [`validate::validate`], and a metered run of the
//! [`interpreter`] on its own thread. The caller waits at most `timeout`;
//! a run that overstays is cancelled and reported as a timeout.

pub mod ast;
pub mod interpreter;
pub mod parser;
pub mod validate;

use crate::domain::error::SandboxError;
use crate::domain::indicator::FormulaSpec;
use crate::domain::ohlcv::{Bar, PriceField};
use ast::Program;
use interpreter::{Budget, Interpreter, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 64;
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: usize,
    pub max_source_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_MB * 1024 * 1024,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

/// Read-only snapshot of the price columns handed to a formula.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaInput {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl FormulaInput {
    pub fn from_bars(bars: &[Bar]) -> Self {
        Self {
            open: PriceField::Open.column(bars),
            high: PriceField::High.column(bars),
            low: PriceField::Low.column(bars),
            close: PriceField::Close.column(bars),
            volume: PriceField::Volume.column(bars),
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }
}

pub type FormulaOutputs = BTreeMap<String, Vec<Option<f64>>>;

#[derive(Debug, Clone, Default)]
pub struct FormulaExecutor {
    limits: SandboxLimits,
}

impl FormulaExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Parses and statically validates a formula body without running it.
    pub fn check(&self, body: &str) -> Result<Program, SandboxError> {
        let program = parser::parse(body)?;
        validate::validate(body, &program, self.limits.max_source_bytes)?;
        Ok(program)
    }

    /// Runs a formula against one instrument's columns.
    ///
    /// Either every declared output comes back as a full-length column or the
    /// whole invocation fails; there are no partial results.
    pub fn execute(&self, formula: &FormulaSpec, input: FormulaInput) -> Result<FormulaOutputs, SandboxError> {
        let program = self.check(&formula.body)?;
        let rows = input.len();

        let mut bindings = vec![
            ("open".to_string(), Value::Series(input.open)),
            ("high".to_string(), Value::Series(input.high)),
            ("low".to_string(), Value::Series(input.low)),
            ("close".to_string(), Value::Series(input.close)),
            ("volume".to_string(), Value::Series(input.volume)),
            ("bars".to_string(), Value::Scalar(rows as f64)),
        ];
        for (name, value) in &formula.parameters {
            bindings.push((name.clone(), Value::Scalar(*value)));
        }

        let timeout_ms = self.limits.timeout.as_millis() as u64;
        let cancel = Arc::new(AtomicBool::new(false));
        let budget = Budget {
            deadline: Instant::now() + self.limits.timeout,
            timeout_ms,
            memory_limit: self.limits.memory_limit_bytes,
            cancel: Arc::clone(&cancel),
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("formula-{}", formula.fingerprint))
            .spawn(move || {
                let result = Interpreter::new(bindings, budget).and_then(|i| i.run(&program));
                // The receiver may already have given up.
                let _ = tx.send(result);
            })
            .map_err(|e| SandboxError::Runtime {
                message: format!("could not start formula worker: {}", e),
            })?;

        let emitted = match rx.recv_timeout(self.limits.timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                return Err(SandboxError::Timeout { limit_ms: timeout_ms });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(SandboxError::Runtime {
                    message: "formula worker terminated without a result".to_string(),
                });
            }
        };

        check_outputs(formula, emitted, rows)
    }
}

fn contract(reason: impl Into<String>) -> SandboxError {
    SandboxError::OutputContract {
        reason: reason.into(),
    }
}

fn check_outputs(formula: &FormulaSpec, emitted: Vec<(String, Value)>, rows: usize) -> Result<FormulaOutputs, SandboxError> {
    let mut values: BTreeMap<String, Value> = emitted.into_iter().collect();

    if let Some(extra) = values.keys().find(|k| !formula.outputs.contains(*k)) {
        return Err(contract(format!("emitted undeclared output '{}'", extra)));
    }

    let mut outputs = FormulaOutputs::new();
    for name in &formula.outputs {
        let series = match values.remove(name) {
            Some(Value::Series(series)) => series,
            Some(other) => {
                return Err(contract(format!(
                    "output '{}' must be a series, got {}",
                    name,
                    other.type_name()
                )));
            }
            None => return Err(contract(format!("declared output '{}' was never emitted", name))),
        };
        if series.len() != rows {
            return Err(contract(format!(
                "output '{}' has {} rows, expected {}",
                name,
                series.len(),
                rows
            )));
        }
        if let Some(row) = series.iter().position(|v| v.is_infinite()) {
            return Err(contract(format!("output '{}' is infinite at row {}", name, row)));
        }
        let column = series
            .into_iter()
            .map(|v| if v.is_nan() { None } else { Some(v) })
            .collect();
        outputs.insert(name.clone(), column);
    }
    Ok(outputs)
}
