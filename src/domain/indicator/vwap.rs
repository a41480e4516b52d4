//! VWAP (Volume-Weighted Average Price) on typical prices.
//!
//! period == 0: cumulative from the first row, defined everywhere.
//! period > 0: rolling window, undefined before period-1.
//! A window with zero total volume yields the row's typical price.

use crate::domain::ohlcv::Bar;

pub fn calculate_vwap(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];

    if period == 0 {
        let mut pv = 0.0;
        let mut vol = 0.0;
        for (i, bar) in bars.iter().enumerate() {
            pv += bar.typical_price() * bar.volume as f64;
            vol += bar.volume as f64;
            out[i] = Some(if vol == 0.0 { bar.typical_price() } else { pv / vol });
        }
        return out;
    }

    for i in (period - 1)..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let pv: f64 = window
            .iter()
            .map(|b| b.typical_price() * b.volume as f64)
            .sum();
        let vol: f64 = window.iter().map(|b| b.volume as f64).sum();
        out[i] = Some(if vol == 0.0 {
            bars[i].typical_price()
        } else {
            pv / vol
        });
    }
    out
}
