//! Tree-walking interpreter for validated formulas.
//!
//! Values are scalars, numeric series or (inert) text. Scalars broadcast over
//! series. Every arithmetic result that is not finite becomes NaN, so division
//! by zero never leaks an infinity. Execution is metered: a step counter and
//! every per-element builtin loop poll the cancel flag and the deadline, and
//! every series allocation is checked against the memory ceiling before it
//! happens. The ceiling covers named bindings plus the temporaries held by
//! expressions still being evaluated.

use super::ast::{BinaryOp, Expr, ExprKind, Program, Stmt, StmtKind};
use super::validate::VOCABULARY;
use crate::domain::error::SandboxError;
use crate::domain::indicator::sma::calculate_sma;
use crate::domain::indicator::stddev::calculate_stddev;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const CHECK_INTERVAL: usize = 256;
/// Window-scan work done between two polls of the budget.
const WORK_PER_CHECK: usize = 1 << 16;
const EQ_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Series(Vec<f64>),
    Text(String),
}

impl Value {
    fn bytes(&self) -> usize {
        match self {
            Value::Scalar(_) => std::mem::size_of::<f64>(),
            Value::Series(s) => s.len() * std::mem::size_of::<f64>(),
            Value::Text(t) => t.len(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Series(_) => "series",
            Value::Text(_) => "text",
        }
    }

    fn at(&self, i: usize) -> f64 {
        match self {
            Value::Scalar(x) => *x,
            Value::Series(s) => s.get(i).copied().unwrap_or(f64::NAN),
            Value::Text(_) => f64::NAN,
        }
    }
}

/// Resource bounds for one run.
#[derive(Debug, Clone)]
pub struct Budget {
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub memory_limit: usize,
    pub cancel: Arc<AtomicBool>,
}

impl Budget {
    fn expired(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    fn check(&self) -> Result<(), SandboxError> {
        if self.expired() {
            return Err(SandboxError::Timeout {
                limit_ms: self.timeout_ms,
            });
        }
        Ok(())
    }

    /// Checks the budget on every `CHECK_INTERVAL`-th element of a loop.
    fn poll(&self, i: usize) -> Result<(), SandboxError> {
        if i % CHECK_INTERVAL == 0 { self.check() } else { Ok(()) }
    }
}

pub struct Interpreter {
    env: HashMap<String, Value>,
    emitted: Vec<String>,
    live_bytes: usize,
    /// Bytes held by evaluated but not yet consumed values.
    in_flight: usize,
    budget: Budget,
    steps: usize,
}

fn clean(x: f64) -> f64 {
    if x.is_finite() { x } else { f64::NAN }
}

fn runtime(message: impl Into<String>) -> SandboxError {
    SandboxError::Runtime {
        message: message.into(),
    }
}

fn window_sum(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    for i in window.saturating_sub(1)..values.len() {
        out[i] = Some(values[i + 1 - window..=i].iter().sum());
    }
    out
}

/// Runs a windowed calculator over consecutive slices of the input, polling
/// the budget between slices.
fn windowed(
    values: &[f64],
    window: usize,
    budget: &Budget,
    calculate: impl Fn(&[f64], usize) -> Vec<Option<f64>>,
) -> Result<Vec<f64>, SandboxError> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return Ok(out);
    }
    let rows = (WORK_PER_CHECK / window).max(1);
    let mut start = window - 1;
    while start < values.len() {
        budget.check()?;
        let end = (start + rows).min(values.len());
        let first = start + 1 - window;
        let computed = calculate(&values[first..end], window);
        for (offset, value) in computed.into_iter().enumerate().skip(window - 1) {
            out[first + offset] = value.map_or(f64::NAN, clean);
        }
        start = end;
    }
    Ok(out)
}

/// Sliding minimum or maximum over a monotonic deque of row indices. NaN rows
/// are skipped; a window with no numbers yields NaN.
fn rolling_extreme(
    values: &[f64],
    window: usize,
    budget: &Budget,
    keeps: fn(f64, f64) -> bool,
) -> Result<Vec<f64>, SandboxError> {
    let mut out = Vec::with_capacity(values.len());
    let mut candidates: VecDeque<usize> = VecDeque::new();
    for (i, &x) in values.iter().enumerate() {
        budget.poll(i)?;
        if !x.is_nan() {
            while let Some(&back) = candidates.back() {
                if keeps(values[back], x) {
                    break;
                }
                candidates.pop_back();
            }
            candidates.push_back(i);
        }
        while candidates.front().is_some_and(|&front| front + window <= i) {
            candidates.pop_front();
        }
        out.push(if i + 1 >= window {
            candidates.front().map_or(f64::NAN, |&j| values[j])
        } else {
            f64::NAN
        });
    }
    Ok(out)
}

/// SMA-seeded exponential average, matching the built-in EMA indicator.
fn exponential(values: &[f64], period: usize, budget: &Budget) -> Result<Vec<f64>, SandboxError> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return Ok(out);
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = 0.0;
    for (i, v) in values[..period].iter().enumerate() {
        budget.poll(i)?;
        ema += v;
    }
    ema /= period as f64;
    out[period - 1] = clean(ema);
    for i in period..values.len() {
        budget.poll(i)?;
        ema = values[i] * k + ema * (1.0 - k);
        out[i] = clean(ema);
    }
    Ok(out)
}

fn truthy(x: f64) -> bool {
    !x.is_nan() && x != 0.0
}

fn compare(a: f64, b: f64, test: impl Fn(f64, f64) -> bool) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if test(a, b) {
        1.0
    } else {
        0.0
    }
}

impl Interpreter {
    pub fn new(inputs: Vec<(String, Value)>, budget: Budget) -> Result<Self, SandboxError> {
        let mut interpreter = Self {
            env: HashMap::new(),
            emitted: Vec::new(),
            live_bytes: 0,
            in_flight: 0,
            budget,
            steps: 0,
        };
        for (name, value) in inputs {
            interpreter.bind(name, value)?;
        }
        Ok(interpreter)
    }

    /// Runs the program and returns the emitted bindings in first-emit order.
    pub fn run(mut self, program: &Program) -> Result<Vec<(String, Value)>, SandboxError> {
        self.exec_block(&program.stmts)?;
        let emitted = std::mem::take(&mut self.emitted);
        Ok(emitted
            .into_iter()
            .filter_map(|name| self.env.remove(&name).map(|v| (name, v)))
            .collect())
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps += 1;
        self.budget.poll(self.steps)
    }

    fn over_limit(&self, requested: usize) -> Result<(), SandboxError> {
        if requested > self.budget.memory_limit {
            return Err(SandboxError::MemoryLimit {
                limit: self.budget.memory_limit,
                requested,
            });
        }
        Ok(())
    }

    /// Checks that a new series of `len` elements fits next to the live
    /// bindings and the temporaries currently held.
    fn allocate(&self, len: usize) -> Result<(), SandboxError> {
        let bytes = len.saturating_mul(std::mem::size_of::<f64>());
        self.over_limit(self.live_bytes.saturating_add(self.in_flight).saturating_add(bytes))
    }

    fn release(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
    }

    /// Evaluates an expression for a statement, which takes ownership of it.
    fn eval_owned(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        let value = self.eval(expr)?;
        self.release(value.bytes());
        Ok(value)
    }

    fn bind(&mut self, name: String, value: Value) -> Result<(), SandboxError> {
        let old = self.env.get(&name).map(Value::bytes).unwrap_or(0);
        let live = self.live_bytes - old + value.bytes();
        self.over_limit(live.saturating_add(self.in_flight))?;
        self.live_bytes = live;
        self.env.insert(name, value);
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), SandboxError> {
        stmts.iter().try_for_each(|stmt| self.exec_stmt(stmt))
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), SandboxError> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Import { module } => Err(SandboxError::Rejected {
                reason: format!("import statements are not allowed (module '{}')", module),
                position: stmt.pos,
            }),
            StmtKind::Assign { target, value } => {
                let value = self.eval_owned(value)?;
                self.bind(target.clone(), value)
            }
            StmtKind::Emit { target, value } => {
                let value = self.eval_owned(value)?;
                self.bind(target.clone(), value)?;
                if !self.emitted.contains(target) {
                    self.emitted.push(target.clone());
                }
                Ok(())
            }
            StmtKind::For { var, count, body } => {
                let count = match self.eval_owned(count)? {
                    Value::Scalar(n) if n.is_finite() && n >= 0.0 => n.floor() as u64,
                    other => {
                        return Err(runtime(format!(
                            "range() needs a non-negative number, got {}",
                            other.type_name()
                        )));
                    }
                };
                for i in 0..count {
                    self.tick()?;
                    self.bind(var.clone(), Value::Scalar(i as f64))?;
                    self.exec_block(body)?;
                }
                Ok(())
            }
            StmtKind::Expr(expr) => self.eval_owned(expr).map(|_| ()),
        }
    }

    /// Evaluates an expression and counts its result as in flight until the
    /// consumer releases it.
    fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        let value = self.eval_expr(expr)?;
        self.in_flight = self.in_flight.saturating_add(value.bytes());
        Ok(value)
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.tick()?;
        match &expr.kind {
            ExprKind::Number(x) => Ok(Value::Scalar(*x)),
            ExprKind::Str(text) => Ok(Value::Text(text.clone())),
            ExprKind::Name(name) => {
                if VOCABULARY.contains(&name.as_str()) && !self.env.contains_key(name) {
                    return Err(runtime(format!("'{}' is a function and must be called", name)));
                }
                let value = self
                    .env
                    .get(name)
                    .ok_or_else(|| runtime(format!("undefined name '{}'", name)))?;
                if let Value::Series(s) = value {
                    self.allocate(s.len())?;
                }
                Ok(value.clone())
            }
            ExprKind::Attribute { .. } | ExprKind::Index { .. } => Err(SandboxError::Rejected {
                reason: "expression kind is not allowed".to_string(),
                position: expr.pos,
            }),
            ExprKind::Call { callee, args } => {
                let ExprKind::Name(name) = &callee.kind else {
                    return Err(SandboxError::Rejected {
                        reason: "only named functions may be called".to_string(),
                        position: expr.pos,
                    });
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                let held: usize = values.iter().map(Value::bytes).sum();
                let out = self.call(name, values)?;
                self.release(held);
                Ok(out)
            }
            ExprKind::Neg(operand) => {
                let value = self.eval(operand)?;
                let held = value.bytes();
                let out = self.map_unary(value, |x| -x)?;
                self.release(held);
                Ok(out)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                let held = a.bytes() + b.bytes();
                let f: fn(f64, f64) -> f64 = match op {
                    BinaryOp::Add => |a, b| a + b,
                    BinaryOp::Sub => |a, b| a - b,
                    BinaryOp::Mul => |a, b| a * b,
                    BinaryOp::Div => |a, b| if b == 0.0 { f64::NAN } else { a / b },
                    BinaryOp::Rem => |a, b| if b == 0.0 { f64::NAN } else { a % b },
                    BinaryOp::Pow => f64::powf,
                    BinaryOp::Lt => |a, b| compare(a, b, |x, y| x < y),
                    BinaryOp::Gt => |a, b| compare(a, b, |x, y| x > y),
                    BinaryOp::Le => |a, b| compare(a, b, |x, y| x <= y),
                    BinaryOp::Ge => |a, b| compare(a, b, |x, y| x >= y),
                    BinaryOp::Eq => |a, b| compare(a, b, |x, y| (x - y).abs() < EQ_TOLERANCE),
                    BinaryOp::Ne => |a, b| compare(a, b, |x, y| (x - y).abs() >= EQ_TOLERANCE),
                };
                let out = self.map_binary(a, b, f)?;
                self.release(held);
                Ok(out)
            }
        }
    }

    fn map_unary(&self, value: Value, f: impl Fn(f64) -> f64) -> Result<Value, SandboxError> {
        match value {
            Value::Scalar(x) => Ok(Value::Scalar(clean(f(x)))),
            Value::Series(mut s) => {
                for (i, x) in s.iter_mut().enumerate() {
                    self.budget.poll(i)?;
                    *x = clean(f(*x));
                }
                Ok(Value::Series(s))
            }
            Value::Text(_) => Err(runtime("strings cannot be used in arithmetic")),
        }
    }

    fn map_binary(&self, a: Value, b: Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, SandboxError> {
        match (a, b) {
            (Value::Scalar(x), Value::Scalar(y)) => Ok(Value::Scalar(clean(f(x, y)))),
            (Value::Scalar(x), Value::Series(mut s)) => {
                for (i, v) in s.iter_mut().enumerate() {
                    self.budget.poll(i)?;
                    *v = clean(f(x, *v));
                }
                Ok(Value::Series(s))
            }
            (Value::Series(mut s), Value::Scalar(y)) => {
                for (i, v) in s.iter_mut().enumerate() {
                    self.budget.poll(i)?;
                    *v = clean(f(*v, y));
                }
                Ok(Value::Series(s))
            }
            (Value::Series(mut s), Value::Series(t)) => {
                if s.len() != t.len() {
                    return Err(runtime(format!(
                        "series length mismatch ({} vs {})",
                        s.len(),
                        t.len()
                    )));
                }
                for (i, (v, w)) in s.iter_mut().zip(&t).enumerate() {
                    self.budget.poll(i)?;
                    *v = clean(f(*v, *w));
                }
                Ok(Value::Series(s))
            }
            _ => Err(runtime("strings cannot be used in arithmetic")),
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let arity = |expected: &[usize]| -> Result<(), SandboxError> {
            if expected.contains(&args.len()) {
                Ok(())
            } else {
                Err(runtime(format!(
                    "{}() expects {} argument(s), got {}",
                    name,
                    expected
                        .iter()
                        .map(|n| n.to_string())
                        .collect::<Vec<_>>()
                        .join(" or "),
                    args.len()
                )))
            }
        };

        match name {
            "sma" | "ema" | "rolling_sum" | "rolling_mean" | "rolling_min" | "rolling_max"
            | "rolling_std" => {
                arity(&[2])?;
                let mut args = args.into_iter();
                let series = series_arg(name, args.next())?;
                let window = count_arg(name, args.next(), 1)?;
                self.allocate(series.len())?;
                let budget = &self.budget;
                let out = match name {
                    "sma" | "rolling_mean" => windowed(&series, window, budget, calculate_sma)?,
                    "ema" => exponential(&series, window, budget)?,
                    "rolling_std" => windowed(&series, window, budget, calculate_stddev)?,
                    "rolling_sum" => windowed(&series, window, budget, window_sum)?,
                    "rolling_min" => rolling_extreme(&series, window, budget, |kept, x| kept < x)?,
                    _ => rolling_extreme(&series, window, budget, |kept, x| kept > x)?,
                };
                Ok(Value::Series(out))
            }
            "shift" | "diff" => {
                if name == "shift" {
                    arity(&[2])?;
                } else {
                    arity(&[1, 2])?;
                }
                let mut args = args.into_iter();
                let series = series_arg(name, args.next())?;
                let k = match args.next() {
                    Some(v) => count_arg(name, Some(v), 0)?,
                    None => 1,
                };
                self.allocate(series.len())?;
                let mut out = Vec::with_capacity(series.len());
                for i in 0..series.len() {
                    self.budget.poll(i)?;
                    out.push(if i < k {
                        f64::NAN
                    } else if name == "shift" {
                        series[i - k]
                    } else {
                        clean(series[i] - series[i - k])
                    });
                }
                Ok(Value::Series(out))
            }
            "cumsum" => {
                arity(&[1])?;
                let series = series_arg(name, args.into_iter().next())?;
                self.allocate(series.len())?;
                let mut total = 0.0;
                let mut out = Vec::with_capacity(series.len());
                for (i, x) in series.iter().enumerate() {
                    self.budget.poll(i)?;
                    out.push(if x.is_nan() {
                        f64::NAN
                    } else {
                        total += x;
                        clean(total)
                    });
                }
                Ok(Value::Series(out))
            }
            "abs" | "sqrt" | "log" | "exp" | "is_nan" => {
                arity(&[1])?;
                let value = args.into_iter().next().unwrap_or(Value::Scalar(f64::NAN));
                let f: fn(f64) -> f64 = match name {
                    "abs" => f64::abs,
                    "sqrt" => f64::sqrt,
                    "log" => f64::ln,
                    "exp" => f64::exp,
                    _ => |x| if x.is_nan() { 1.0 } else { 0.0 },
                };
                self.map_unary(value, f)
            }
            "min" | "max" | "fill" => {
                arity(&[2])?;
                let mut args = args.into_iter();
                let (a, b) = (args.next(), args.next());
                let (Some(a), Some(b)) = (a, b) else {
                    return Err(runtime(format!("{}() expects 2 arguments", name)));
                };
                let f: fn(f64, f64) -> f64 = match name {
                    "min" => f64::min,
                    "max" => f64::max,
                    _ => |x, fallback| if x.is_nan() { fallback } else { x },
                };
                self.map_binary(a, b, f)
            }
            "clip" => {
                arity(&[3])?;
                let mut args = args.into_iter();
                let (Some(x), Some(lo), Some(hi)) = (args.next(), args.next(), args.next()) else {
                    return Err(runtime("clip() expects 3 arguments"));
                };
                let lower = self.map_binary(x, lo, f64::max)?;
                self.map_binary(lower, hi, f64::min)
            }
            "where" => {
                arity(&[3])?;
                let mut len = None;
                for arg in &args {
                    match arg {
                        Value::Series(s) => match len {
                            Some(l) if l != s.len() => {
                                return Err(runtime(format!(
                                    "series length mismatch ({} vs {})",
                                    l,
                                    s.len()
                                )));
                            }
                            _ => len = Some(s.len()),
                        },
                        Value::Text(_) => return Err(runtime("where() takes numeric arguments")),
                        Value::Scalar(_) => {}
                    }
                }
                let pick = |i: usize| {
                    if truthy(args[0].at(i)) {
                        args[1].at(i)
                    } else {
                        args[2].at(i)
                    }
                };
                match len {
                    None => Ok(Value::Scalar(pick(0))),
                    Some(len) => {
                        self.allocate(len)?;
                        let mut out = Vec::with_capacity(len);
                        for i in 0..len {
                            self.budget.poll(i)?;
                            out.push(pick(i));
                        }
                        Ok(Value::Series(out))
                    }
                }
            }
            "concat" => {
                arity(&[2])?;
                let mut parts = Vec::with_capacity(2);
                for arg in args {
                    match arg {
                        Value::Scalar(x) => parts.push(vec![x]),
                        Value::Series(s) => parts.push(s),
                        Value::Text(_) => return Err(runtime("concat() takes numeric arguments")),
                    }
                }
                let total = parts.iter().map(Vec::len).sum::<usize>();
                self.allocate(total)?;
                self.budget.check()?;
                Ok(Value::Series(parts.concat()))
            }
            "len" => {
                arity(&[1])?;
                match &args[0] {
                    Value::Series(s) => Ok(Value::Scalar(s.len() as f64)),
                    Value::Scalar(_) => Ok(Value::Scalar(1.0)),
                    Value::Text(t) => Ok(Value::Scalar(t.chars().count() as f64)),
                }
            }
            "nan" => {
                arity(&[0])?;
                Ok(Value::Scalar(f64::NAN))
            }
            _ => Err(runtime(format!("unknown function '{}'", name))),
        }
    }
}

fn series_arg(name: &str, value: Option<Value>) -> Result<Vec<f64>, SandboxError> {
    match value {
        Some(Value::Series(s)) => Ok(s),
        Some(other) => Err(runtime(format!(
            "{}() needs a series as its first argument, got {}",
            name,
            other.type_name()
        ))),
        None => Err(runtime(format!("{}() is missing its series argument", name))),
    }
}

fn count_arg(name: &str, value: Option<Value>, minimum: usize) -> Result<usize, SandboxError> {
    match value {
        Some(Value::Scalar(n)) if n.is_finite() && n.fract() == 0.0 && n >= minimum as f64 => {
            Ok(n as usize)
        }
        _ => Err(runtime(format!(
            "{}() needs an integer argument of at least {}",
            name, minimum
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sandbox::parser::parse;
    use std::time::Duration;

    fn budget(memory_limit: usize) -> Budget {
        Budget {
            deadline: Instant::now() + Duration::from_secs(5),
            timeout_ms: 5000,
            memory_limit,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run_with(source: &str, close: Vec<f64>, memory_limit: usize) -> Result<Vec<(String, Value)>, SandboxError> {
        let program = parse(source).unwrap();
        let inputs = vec![
            ("bars".to_string(), Value::Scalar(close.len() as f64)),
            ("close".to_string(), Value::Series(close)),
        ];
        Interpreter::new(inputs, budget(memory_limit))?.run(&program)
    }

    fn run(source: &str, close: Vec<f64>) -> Vec<(String, Value)> {
        run_with(source, close, 1 << 20).unwrap()
    }

    fn series(out: &[(String, Value)], name: &str) -> Vec<f64> {
        match out.iter().find(|(n, _)| n == name) {
            Some((_, Value::Series(s))) => s.clone(),
            other => panic!("expected series {}, got {:?}", name, other),
        }
    }

    #[test]
    fn scalar_broadcasts_over_series() {
        let out = run("emit x = close * 2 + 1", vec![1.0, 2.0]);
        assert_eq!(series(&out, "x"), vec![3.0, 5.0]);
    }

    #[test]
    fn division_by_zero_is_nan() {
        let out = run("emit x = close / (close - close)", vec![1.0, 2.0]);
        assert!(series(&out, "x").iter().all(|v| v.is_nan()));
    }

    #[test]
    fn log_of_zero_is_nan_not_infinite() {
        let out = run("emit x = log(close)", vec![0.0, 1.0]);
        let x = series(&out, "x");
        assert!(x[0].is_nan());
        assert_eq!(x[1], 0.0);
    }

    #[test]
    fn comparison_yields_flags() {
        let out = run("emit up = close > 1.5", vec![1.0, 2.0]);
        assert_eq!(series(&out, "up"), vec![0.0, 1.0]);
    }

    #[test]
    fn sma_and_shift() {
        let out = run(
            "emit m = sma(close, 2)\nemit p = shift(close, 1)\nemit d = diff(close)",
            vec![1.0, 3.0, 5.0],
        );
        let m = series(&out, "m");
        assert!(m[0].is_nan());
        assert_eq!(m[1], 2.0);
        assert_eq!(m[2], 4.0);
        let p = series(&out, "p");
        assert!(p[0].is_nan());
        assert_eq!(p[2], 3.0);
        assert_eq!(series(&out, "d")[2], 2.0);
    }

    #[test]
    fn rolling_extremes_and_cumsum() {
        let out = run(
            "emit hi = rolling_max(close, 2)\nemit lo = rolling_min(close, 2)\nemit c = cumsum(close)",
            vec![1.0, 3.0, 2.0],
        );
        assert_eq!(series(&out, "hi")[2], 3.0);
        assert_eq!(series(&out, "lo")[2], 2.0);
        assert_eq!(series(&out, "c"), vec![1.0, 4.0, 6.0]);
    }

    #[test]
    fn where_fill_and_clip() {
        let out = run(
            "emit w = where(close > 1, close, 0)\nemit f = fill(shift(close, 1), 0)\nemit c = clip(close, 1.5, 2.5)",
            vec![1.0, 2.0, 3.0],
        );
        assert_eq!(series(&out, "w"), vec![0.0, 2.0, 3.0]);
        assert_eq!(series(&out, "f"), vec![0.0, 1.0, 2.0]);
        assert_eq!(series(&out, "c"), vec![1.5, 2.0, 2.5]);
    }

    #[test]
    fn loops_accumulate() {
        let out = run("acc = close\nfor i in range(3) {\n acc = acc + i\n}\nemit x = acc", vec![0.0, 10.0]);
        assert_eq!(series(&out, "x"), vec![3.0, 13.0]);
    }

    #[test]
    fn negative_shift_is_runtime_error() {
        let err = run_with("emit x = shift(close, -1)", vec![1.0, 2.0], 1 << 20).unwrap_err();
        assert_eq!(err.kind(), "runtime");
    }

    #[test]
    fn undefined_name_is_runtime_error() {
        let err = run_with("emit x = missing + 1", vec![1.0], 1 << 20).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { ref message } if message.contains("missing")));
    }

    #[test]
    fn length_mismatch_is_runtime_error() {
        let err = run_with("emit x = close + concat(close, close)", vec![1.0, 2.0], 1 << 20).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn doubling_series_hits_memory_ceiling() {
        let err = run_with(
            "x = close\nfor i in range(64) {\n x = concat(x, x)\n}\nemit y = close",
            vec![1.0; 100],
            64 * 1024,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "memory_limit");
    }

    #[test]
    fn cancel_flag_stops_execution() {
        let program = parse("for i in range(1e12) {\n x = i\n}").unwrap();
        let b = budget(1 << 20);
        b.cancel.store(true, Ordering::Relaxed);
        let err = Interpreter::new(vec![], b).unwrap().run(&program).unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn cancelled_run_stops_inside_builtins() {
        let close: Vec<f64> = (0..1000).map(f64::from).collect();
        for source in [
            "emit y = rolling_max(close, 2)",
            "emit y = sma(close, 3)",
            "emit y = ema(close, 3)",
            "emit y = cumsum(close)",
            "emit y = shift(close, 1)",
            "emit y = -close",
        ] {
            let program = parse(source).unwrap();
            let b = budget(1 << 20);
            b.cancel.store(true, Ordering::Relaxed);
            let inputs = vec![("close".to_string(), Value::Series(close.clone()))];
            let err = Interpreter::new(inputs, b).unwrap().run(&program).unwrap_err();
            assert_eq!(err.kind(), "timeout", "{}", source);
        }
    }

    #[test]
    fn long_window_scan_stops_at_deadline() {
        let program = parse(
            "x = close\nfor i in range(12) {\n x = concat(x, x)\n}\nemit y = rolling_sum(x, len(x) / 2)",
        )
        .unwrap();
        let b = Budget {
            deadline: Instant::now() + Duration::from_millis(50),
            timeout_ms: 50,
            memory_limit: 64 << 20,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let inputs = vec![("close".to_string(), Value::Series(vec![1.0; 100]))];
        let started = Instant::now();
        let err = Interpreter::new(inputs, b).unwrap().run(&program).unwrap_err();
        assert_eq!(err, SandboxError::Timeout { limit_ms: 50 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn rolling_extremes_match_window_scan() {
        let close = vec![4.0, f64::NAN, 2.0, 7.0, 7.0, 1.0, f64::NAN, f64::NAN, 3.0, 5.0];
        for window in 1..=4 {
            let out = run(
                &format!("emit hi = rolling_max(close, {w})\nemit lo = rolling_min(close, {w})", w = window),
                close.clone(),
            );
            let (hi, lo) = (series(&out, "hi"), series(&out, "lo"));
            for i in 0..close.len() {
                if i + 1 < window {
                    assert!(hi[i].is_nan() && lo[i].is_nan());
                    continue;
                }
                let numbers: Vec<f64> = close[i + 1 - window..=i].iter().copied().filter(|x| !x.is_nan()).collect();
                let expected_hi = numbers.iter().copied().reduce(f64::max);
                let expected_lo = numbers.iter().copied().reduce(f64::min);
                assert_eq!(expected_hi.unwrap_or(f64::NAN).to_bits(), hi[i].to_bits(), "max w={} i={}", window, i);
                assert_eq!(expected_lo.unwrap_or(f64::NAN).to_bits(), lo[i].to_bits(), "min w={} i={}", window, i);
            }
        }
    }

    #[test]
    fn nested_temporaries_count_against_memory_ceiling() {
        let close = vec![1.0; 1000];
        let shallow = "s = concat(close, close)\nt = len(s + s)\nemit y = close";
        assert!(run_with(shallow, close.clone(), 64_000).is_ok());

        let deep = "s = concat(close, close)\nt = len(s + (s + (s + s)))\nemit y = close";
        let err = run_with(deep, close, 64_000).unwrap_err();
        assert_eq!(err.kind(), "memory_limit");
    }

    #[test]
    fn emitted_order_is_first_emit_order() {
        let out = run("emit b = close\nemit a = close\nemit b = close + 1", vec![1.0]);
        let names: Vec<&str> = out.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(series(&out, "b"), vec![2.0]);
    }
}
