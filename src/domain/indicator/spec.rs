//! Indicator declarations.
//!
//! The untyped `name + parameters` map of a strategy document is turned into a
//! tagged [`IndicatorKind`] exactly once, at load time. Unknown names, unknown
//! parameter keys and malformed periods are configuration errors.

use crate::domain::error::StagetraderError;
use crate::domain::ohlcv::{Bar, PriceField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::adx::calculate_adx;
use super::atr::calculate_atr;
use super::bollinger::calculate_bollinger;
use super::cci::calculate_cci;
use super::ema::calculate_ema;
use super::ichimoku::{self, calculate_ichimoku};
use super::macd::{self, calculate_macd};
use super::obv::calculate_obv;
use super::rsi::calculate_rsi;
use super::sma::calculate_sma;
use super::stochastic::calculate_stochastic;
use super::vwap::calculate_vwap;

/// What happens to a strategy run when its formula indicator fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Replace the outputs with all-undefined columns and record a warning.
    #[default]
    Disable,
    /// Fail the run.
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinKind {
    Sma { period: usize, source: PriceField },
    Ema { period: usize, source: PriceField },
    Rsi { period: usize, source: PriceField },
    Macd { fast: usize, slow: usize, signal: usize, source: PriceField },
    Bollinger { period: usize, stddev_mult_x100: u32, source: PriceField },
    Stochastic { k_period: usize, d_period: usize },
    Atr { period: usize },
    Adx { period: usize },
    Cci { period: usize },
    Obv,
    Vwap { period: usize },
    Ichimoku { tenkan: usize, kijun: usize, senkou_b: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormulaSpec {
    pub body: String,
    pub fingerprint: String,
    pub parameters: BTreeMap<String, f64>,
    pub outputs: Vec<String>,
    pub on_error: OnError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorKind {
    Builtin(BuiltinKind),
    Formula(FormulaSpec),
}

/// One validated indicator declaration of a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSpec {
    /// Declared indicator name, e.g. `rsi`.
    pub name: String,
    pub alias: Option<String>,
    pub kind: IndicatorKind,
}

struct ParamReader<'a> {
    indicator: &'a str,
    params: &'a BTreeMap<String, f64>,
    used: Vec<&'static str>,
}

impl<'a> ParamReader<'a> {
    fn new(indicator: &'a str, params: &'a BTreeMap<String, f64>) -> Self {
        Self {
            indicator,
            params,
            used: Vec::new(),
        }
    }

    fn invalid(&self, reason: String) -> StagetraderError {
        StagetraderError::config(format!("indicator '{}'", self.indicator), reason)
    }

    fn raw(&mut self, key: &'static str) -> Option<f64> {
        self.used.push(key);
        self.params.get(key).copied()
    }

    fn period(&mut self, key: &'static str, default: usize) -> Result<usize, StagetraderError> {
        let period = self.count(key, default)?;
        if period == 0 {
            return Err(self.invalid(format!("parameter '{}' must be at least 1", key)));
        }
        Ok(period)
    }

    fn count(&mut self, key: &'static str, default: usize) -> Result<usize, StagetraderError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v.is_finite() => Ok(v as usize),
            Some(v) => Err(self.invalid(format!(
                "parameter '{}' must be a non-negative integer, got {}",
                key, v
            ))),
        }
    }

    fn positive(&mut self, key: &'static str, default: f64) -> Result<f64, StagetraderError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) if v > 0.0 && v.is_finite() => Ok(v),
            Some(v) => Err(self.invalid(format!("parameter '{}' must be positive, got {}", key, v))),
        }
    }

    fn finish(self) -> Result<(), StagetraderError> {
        if let Some(unknown) = self
            .params
            .keys()
            .find(|k| !self.used.iter().any(|used| *used == k.as_str()))
        {
            return Err(self.invalid(format!("unknown parameter '{}'", unknown)));
        }
        Ok(())
    }
}

fn parse_source(indicator: &str, source: Option<&str>, accepts_source: bool) -> Result<PriceField, StagetraderError> {
    let Some(name) = source else {
        return Ok(PriceField::Close);
    };
    let field = PriceField::parse(name).ok_or_else(|| {
        StagetraderError::config(
            format!("indicator '{}'", indicator),
            format!("unknown source column '{}'", name),
        )
    })?;
    if !accepts_source && field != PriceField::Close {
        return Err(StagetraderError::config(
            format!("indicator '{}'", indicator),
            "this indicator does not take a source column",
        ));
    }
    Ok(field)
}

impl BuiltinKind {
    /// Builds a built-in kind from its declared name and raw parameters.
    pub fn parse(name: &str, params: &BTreeMap<String, f64>, source: Option<&str>) -> Result<Self, StagetraderError> {
        let mut p = ParamReader::new(name, params);
        let kind = match name.to_ascii_lowercase().as_str() {
            "sma" => BuiltinKind::Sma {
                period: p.period("period", 20)?,
                source: parse_source(name, source, true)?,
            },
            "ema" => BuiltinKind::Ema {
                period: p.period("period", 20)?,
                source: parse_source(name, source, true)?,
            },
            "rsi" => BuiltinKind::Rsi {
                period: p.period("period", 14)?,
                source: parse_source(name, source, true)?,
            },
            "macd" => {
                let fast = p.period("fast", macd::DEFAULT_FAST)?;
                let slow = p.period("slow", macd::DEFAULT_SLOW)?;
                let signal = p.period("signal", macd::DEFAULT_SIGNAL)?;
                if fast >= slow {
                    return Err(p.invalid(format!(
                        "fast period ({}) must be shorter than slow period ({})",
                        fast, slow
                    )));
                }
                BuiltinKind::Macd {
                    fast,
                    slow,
                    signal,
                    source: parse_source(name, source, true)?,
                }
            }
            "bollinger" => BuiltinKind::Bollinger {
                period: p.period("period", 20)?,
                stddev_mult_x100: (p.positive("stddev", 2.0)? * 100.0).round() as u32,
                source: parse_source(name, source, true)?,
            },
            "stochastic" => BuiltinKind::Stochastic {
                k_period: p.period("k_period", 14)?,
                d_period: p.period("d_period", 3)?,
            },
            "atr" => BuiltinKind::Atr {
                period: p.period("period", 14)?,
            },
            "adx" => BuiltinKind::Adx {
                period: p.period("period", 14)?,
            },
            "cci" => BuiltinKind::Cci {
                period: p.period("period", 20)?,
            },
            "obv" => BuiltinKind::Obv,
            "vwap" => BuiltinKind::Vwap {
                period: p.count("period", 0)?,
            },
            "ichimoku" => BuiltinKind::Ichimoku {
                tenkan: p.period("tenkan", ichimoku::DEFAULT_TENKAN)?,
                kijun: p.period("kijun", ichimoku::DEFAULT_KIJUN)?,
                senkou_b: p.period("senkou_b", ichimoku::DEFAULT_SENKOU_B)?,
            },
            _ => {
                return Err(StagetraderError::config(
                    format!("indicator '{}'", name),
                    "unknown built-in indicator",
                ));
            }
        };
        p.finish()?;

        if !matches!(
            kind,
            BuiltinKind::Sma { .. }
                | BuiltinKind::Ema { .. }
                | BuiltinKind::Rsi { .. }
                | BuiltinKind::Macd { .. }
                | BuiltinKind::Bollinger { .. }
        ) {
            parse_source(name, source, false)?;
        }
        Ok(kind)
    }

    /// Suffixes appended to the base name, one per output column.
    pub fn output_suffixes(&self) -> &'static [&'static str] {
        match self {
            BuiltinKind::Macd { .. } => &["_line", "_signal", "_histogram"],
            BuiltinKind::Bollinger { .. } => &["_upper", "_middle", "_lower"],
            BuiltinKind::Stochastic { .. } => &["_k", "_d"],
            BuiltinKind::Adx { .. } => &["", "_plus_di", "_minus_di"],
            BuiltinKind::Ichimoku { .. } => &["_tenkan", "_kijun", "_senkou_a", "_senkou_b"],
            _ => &[""],
        }
    }

    fn default_base_name(&self) -> String {
        fn with_source(base: String, source: &PriceField) -> String {
            if *source == PriceField::Close {
                base
            } else {
                format!("{}_{}", base, source)
            }
        }

        match self {
            BuiltinKind::Sma { period, source } => with_source(format!("sma_{}", period), source),
            BuiltinKind::Ema { period, source } => with_source(format!("ema_{}", period), source),
            BuiltinKind::Rsi { period, source } => with_source(format!("rsi_{}", period), source),
            BuiltinKind::Macd {
                fast,
                slow,
                signal,
                source,
            } => with_source(format!("macd_{}_{}_{}", fast, slow, signal), source),
            BuiltinKind::Bollinger {
                period,
                stddev_mult_x100,
                source,
            } => with_source(
                format!("bollinger_{}_{}", period, *stddev_mult_x100 as f64 / 100.0),
                source,
            ),
            BuiltinKind::Stochastic { k_period, d_period } => {
                format!("stochastic_{}_{}", k_period, d_period)
            }
            BuiltinKind::Atr { period } => format!("atr_{}", period),
            BuiltinKind::Adx { period } => format!("adx_{}", period),
            BuiltinKind::Cci { period } => format!("cci_{}", period),
            BuiltinKind::Obv => "obv".to_string(),
            BuiltinKind::Vwap { period: 0 } => "vwap".to_string(),
            BuiltinKind::Vwap { period } => format!("vwap_{}", period),
            BuiltinKind::Ichimoku {
                tenkan,
                kijun,
                senkou_b,
            } => format!("ichimoku_{}_{}_{}", tenkan, kijun, senkou_b),
        }
    }

    /// Computes every output column, in `output_suffixes` order.
    pub fn compute(&self, bars: &[Bar]) -> Vec<Vec<Option<f64>>> {
        match self {
            BuiltinKind::Sma { period, source } => vec![calculate_sma(&source.column(bars), *period)],
            BuiltinKind::Ema { period, source } => vec![calculate_ema(&source.column(bars), *period)],
            BuiltinKind::Rsi { period, source } => vec![calculate_rsi(&source.column(bars), *period)],
            BuiltinKind::Macd {
                fast,
                slow,
                signal,
                source,
            } => {
                let out = calculate_macd(&source.column(bars), *fast, *slow, *signal);
                vec![out.line, out.signal, out.histogram]
            }
            BuiltinKind::Bollinger {
                period,
                stddev_mult_x100,
                source,
            } => {
                let out = calculate_bollinger(&source.column(bars), *period, *stddev_mult_x100);
                vec![out.upper, out.middle, out.lower]
            }
            BuiltinKind::Stochastic { k_period, d_period } => {
                let out = calculate_stochastic(bars, *k_period, *d_period);
                vec![out.k, out.d]
            }
            BuiltinKind::Atr { period } => vec![calculate_atr(bars, *period)],
            BuiltinKind::Adx { period } => {
                let out = calculate_adx(bars, *period);
                vec![out.adx, out.plus_di, out.minus_di]
            }
            BuiltinKind::Cci { period } => vec![calculate_cci(bars, *period)],
            BuiltinKind::Obv => vec![calculate_obv(bars)],
            BuiltinKind::Vwap { period } => vec![calculate_vwap(bars, *period)],
            BuiltinKind::Ichimoku {
                tenkan,
                kijun,
                senkou_b,
            } => {
                let out = calculate_ichimoku(bars, *tenkan, *kijun, *senkou_b);
                vec![out.tenkan, out.kijun, out.senkou_a, out.senkou_b]
            }
        }
    }
}

impl fmt::Display for BuiltinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinKind::Sma { period, source } => write!(f, "SMA({},{})", period, source),
            BuiltinKind::Ema { period, source } => write!(f, "EMA({},{})", period, source),
            BuiltinKind::Rsi { period, source } => write!(f, "RSI({},{})", period, source),
            BuiltinKind::Macd {
                fast,
                slow,
                signal,
                source,
            } => write!(f, "MACD({},{},{},{})", fast, slow, signal, source),
            BuiltinKind::Bollinger {
                period,
                stddev_mult_x100,
                source,
            } => {
                let mult = *stddev_mult_x100 as f64 / 100.0;
                write!(f, "BOLLINGER({},{},{})", period, mult, source)
            }
            BuiltinKind::Stochastic { k_period, d_period } => {
                write!(f, "STOCHASTIC({},{})", k_period, d_period)
            }
            BuiltinKind::Atr { period } => write!(f, "ATR({})", period),
            BuiltinKind::Adx { period } => write!(f, "ADX({})", period),
            BuiltinKind::Cci { period } => write!(f, "CCI({})", period),
            BuiltinKind::Obv => write!(f, "OBV"),
            BuiltinKind::Vwap { period } => write!(f, "VWAP({})", period),
            BuiltinKind::Ichimoku {
                tenkan,
                kijun,
                senkou_b,
            } => write!(f, "ICHIMOKU({},{},{})", tenkan, kijun, senkou_b),
        }
    }
}

impl FormulaSpec {
    pub fn new(body: String, parameters: BTreeMap<String, f64>, outputs: Vec<String>, on_error: OnError) -> Self {
        let hash = blake3::hash(body.as_bytes());
        let fingerprint = hash.to_hex()[..16].to_string();
        Self {
            body,
            fingerprint,
            parameters,
            outputs,
            on_error,
        }
    }
}

impl fmt::Display for FormulaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FORMULA({}", self.fingerprint)?;
        for (key, value) in &self.parameters {
            write!(f, ";{}={}", key, value)?;
        }
        write!(f, ";{})", self.outputs.join(","))
    }
}

impl IndicatorSpec {
    /// Key identifying the computation regardless of alias; equal keys share
    /// one cache entry.
    pub fn canonical_key(&self) -> String {
        match &self.kind {
            IndicatorKind::Builtin(kind) => kind.to_string(),
            IndicatorKind::Formula(formula) => formula.to_string(),
        }
    }

    /// Column names this indicator exposes to conditions.
    pub fn output_names(&self) -> Vec<String> {
        match &self.kind {
            IndicatorKind::Builtin(kind) => {
                let base = self
                    .alias
                    .clone()
                    .unwrap_or_else(|| kind.default_base_name());
                kind.output_suffixes()
                    .iter()
                    .map(|suffix| format!("{}{}", base, suffix))
                    .collect()
            }
            IndicatorKind::Formula(formula) => formula.outputs.clone(),
        }
    }

    pub fn is_single_output(&self) -> bool {
        match &self.kind {
            IndicatorKind::Builtin(kind) => kind.output_suffixes().len() == 1,
            IndicatorKind::Formula(formula) => formula.outputs.len() == 1,
        }
    }

    /// Label used in logs and warnings.
    pub fn label(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn builtin(name: &str, pairs: &[(&str, f64)]) -> IndicatorSpec {
        IndicatorSpec {
            name: name.into(),
            alias: None,
            kind: IndicatorKind::Builtin(BuiltinKind::parse(name, &params(pairs), None).unwrap()),
        }
    }

    #[test]
    fn defaults_apply() {
        let kind = BuiltinKind::parse("rsi", &BTreeMap::new(), None).unwrap();
        assert_eq!(
            kind,
            BuiltinKind::Rsi {
                period: 14,
                source: PriceField::Close
            }
        );
    }

    #[test]
    fn canonical_key_format() {
        assert_eq!(builtin("rsi", &[("period", 14.0)]).canonical_key(), "RSI(14,close)");
        assert_eq!(builtin("macd", &[]).canonical_key(), "MACD(12,26,9,close)");
        assert_eq!(
            builtin("bollinger", &[("stddev", 2.5)]).canonical_key(),
            "BOLLINGER(20,2.5,close)"
        );
    }

    #[test]
    fn distinct_periods_get_distinct_names() {
        let fast = builtin("sma", &[("period", 10.0)]);
        let slow = builtin("sma", &[("period", 50.0)]);
        assert_eq!(fast.output_names(), vec!["sma_10"]);
        assert_eq!(slow.output_names(), vec!["sma_50"]);
        assert_ne!(fast.canonical_key(), slow.canonical_key());
    }

    #[test]
    fn multi_output_names() {
        assert_eq!(
            builtin("macd", &[]).output_names(),
            vec!["macd_12_26_9_line", "macd_12_26_9_signal", "macd_12_26_9_histogram"]
        );
        assert_eq!(
            builtin("adx", &[]).output_names(),
            vec!["adx_14", "adx_14_plus_di", "adx_14_minus_di"]
        );
        assert!(!builtin("adx", &[]).is_single_output());
    }

    #[test]
    fn non_close_source_is_part_of_name() {
        let kind = BuiltinKind::parse("ema", &params(&[("period", 5.0)]), Some("high")).unwrap();
        let spec = IndicatorSpec {
            name: "ema".into(),
            alias: None,
            kind: IndicatorKind::Builtin(kind),
        };
        assert_eq!(spec.output_names(), vec!["ema_5_high"]);
        assert_eq!(spec.canonical_key(), "EMA(5,high)");
    }

    #[test]
    fn alias_replaces_base_name() {
        let mut spec = builtin("bollinger", &[]);
        spec.alias = Some("bb".into());
        assert_eq!(spec.output_names(), vec!["bb_upper", "bb_middle", "bb_lower"]);
    }

    #[test]
    fn unknown_indicator_is_config_error() {
        let err = BuiltinKind::parse("supertrend", &BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, StagetraderError::Configuration { .. }));
    }

    #[test]
    fn unknown_parameter_is_config_error() {
        let err = BuiltinKind::parse("rsi", &params(&[("length", 14.0)]), None).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'length'"));
    }

    #[test]
    fn fractional_or_zero_period_rejected() {
        assert!(BuiltinKind::parse("sma", &params(&[("period", 2.5)]), None).is_err());
        assert!(BuiltinKind::parse("sma", &params(&[("period", 0.0)]), None).is_err());
    }

    #[test]
    fn vwap_allows_zero_period() {
        let kind = BuiltinKind::parse("vwap", &params(&[("period", 0.0)]), None).unwrap();
        assert_eq!(kind, BuiltinKind::Vwap { period: 0 });
    }

    #[test]
    fn source_rejected_where_not_applicable() {
        assert!(BuiltinKind::parse("atr", &BTreeMap::new(), Some("high")).is_err());
        assert!(BuiltinKind::parse("atr", &BTreeMap::new(), Some("close")).is_ok());
        assert!(BuiltinKind::parse("sma", &BTreeMap::new(), Some("bogus")).is_err());
    }

    #[test]
    fn macd_requires_fast_below_slow() {
        assert!(BuiltinKind::parse("macd", &params(&[("fast", 30.0)]), None).is_err());
    }

    #[test]
    fn formula_key_depends_on_body_and_params() {
        let a = FormulaSpec::new("emit x = close".into(), params(&[("n", 1.0)]), vec!["x".into()], OnError::Disable);
        let b = FormulaSpec::new("emit x = open".into(), params(&[("n", 1.0)]), vec!["x".into()], OnError::Disable);
        let c = FormulaSpec::new("emit x = close".into(), params(&[("n", 2.0)]), vec!["x".into()], OnError::Disable);
        assert_ne!(a.to_string(), b.to_string());
        assert_ne!(a.to_string(), c.to_string());
        assert_eq!(a.fingerprint.len(), 16);
        assert!(a.to_string().starts_with("FORMULA("));
    }

    #[test]
    fn compute_returns_one_column_per_output() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| Bar {
                instrument_id: "T".into(),
                date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.0 + i as f64 * 0.1,
                volume: 100,
            })
            .collect();
        for name in ["sma", "macd", "bollinger", "stochastic", "adx", "ichimoku", "obv", "vwap"] {
            let kind = BuiltinKind::parse(name, &BTreeMap::new(), None).unwrap();
            let columns = kind.compute(&bars);
            assert_eq!(columns.len(), kind.output_suffixes().len(), "{}", name);
            assert!(columns.iter().all(|c| c.len() == bars.len()));
        }
    }
}
