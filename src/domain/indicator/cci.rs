//! CCI (Commodity Channel Index).
//!
//! CCI = (TP - SMA(TP)) / (0.015 * mean deviation) over n typical prices.
//! A zero mean deviation yields 0. Warmup: first (n-1) rows are undefined.

use crate::domain::ohlcv::Bar;

const LAMBERT: f64 = 0.015;

pub fn calculate_cci(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 {
        return out;
    }

    let tp: Vec<f64> = bars.iter().map(Bar::typical_price).collect();
    for i in (period - 1)..bars.len() {
        let window = &tp[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let mean_dev = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = Some(if mean_dev == 0.0 {
            0.0
        } else {
            (tp[i] - mean) / (LAMBERT * mean_dev)
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_bar(day: u32, close: f64) -> Bar {
        Bar {
            instrument_id: "TEST".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn cci_flat_is_zero() {
        let bars: Vec<Bar> = (1..=5).map(|d| make_bar(d, 10.0)).collect();
        let out = calculate_cci(&bars, 3);
        assert!(out[1].is_none());
        assert_eq!(out[4], Some(0.0));
    }

    #[test]
    fn cci_known_value() {
        let bars = vec![make_bar(1, 1.0), make_bar(2, 2.0), make_bar(3, 3.0)];
        let out = calculate_cci(&bars, 3);
        // mean 2, mean deviation 2/3 → (3 - 2) / (0.015 * 2/3) = 100
        assert!((out[2].unwrap() - 100.0).abs() < 1e-9);
    }
}
