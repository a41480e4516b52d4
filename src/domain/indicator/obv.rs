//! OBV (On-Balance Volume).

use crate::domain::ohlcv::Bar;

/// OBV[0] = volume[0]
/// If close[i] > close[i-1]: OBV[i] = OBV[i-1] + volume[i]
/// If close[i] < close[i-1]: OBV[i] = OBV[i-1] - volume[i]
/// If close[i] == close[i-1]: OBV[i] = OBV[i-1]
///
/// No warmup period; every row is defined.
pub fn calculate_obv(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(bars.len());
    let mut obv = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            obv = bar.volume as f64;
        } else if bar.close > bars[i - 1].close {
            obv += bar.volume as f64;
        } else if bar.close < bars[i - 1].close {
            obv -= bar.volume as f64;
        }
        out.push(Some(obv));
    }
    out
}
