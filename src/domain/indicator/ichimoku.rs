//! Ichimoku cloud lines.
//!
//! tenkan / kijun: midpoint of the highest high and lowest low over their
//! periods. Senkou spans are displaced forward by `kijun` rows, so row i
//! reads values computed at row i - kijun. The chikou span is not produced
//! because it would read future prices.

use crate::domain::ohlcv::Bar;

pub const DEFAULT_TENKAN: usize = 9;
pub const DEFAULT_KIJUN: usize = 26;
pub const DEFAULT_SENKOU_B: usize = 52;

#[derive(Debug, Clone, PartialEq)]
pub struct IchimokuColumns {
    pub tenkan: Vec<Option<f64>>,
    pub kijun: Vec<Option<f64>>,
    pub senkou_a: Vec<Option<f64>>,
    pub senkou_b: Vec<Option<f64>>,
}

fn midpoint(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        out[i] = Some((highest + lowest) / 2.0);
    }
    out
}

fn displace(values: &[Option<f64>], shift: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| if i >= shift { values[i - shift] } else { None })
        .collect()
}

pub fn calculate_ichimoku(bars: &[Bar], tenkan_period: usize, kijun_period: usize, senkou_b_period: usize) -> IchimokuColumns {
    let tenkan = midpoint(bars, tenkan_period);
    let kijun = midpoint(bars, kijun_period);

    let span_a: Vec<Option<f64>> = tenkan
        .iter()
        .zip(&kijun)
        .map(|(t, k)| Some(((*t)? + (*k)?) / 2.0))
        .collect();
    let span_b = midpoint(bars, senkou_b_period);

    IchimokuColumns {
        senkou_a: displace(&span_a, kijun_period),
        senkou_b: displace(&span_b, kijun_period),
        tenkan,
        kijun,
    }
}
