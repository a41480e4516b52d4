//! Stochastic oscillator.
//!
//! %K = (close - lowest_low) / (highest_high - lowest_low) * 100 over k bars;
//! a zero range yields 50. %D = SMA(d) of %K.
//! Warmup: %K undefined before k-1, %D undefined before k-1 + d-1.

use super::sma::calculate_sma;
use crate::domain::ohlcv::Bar;

#[derive(Debug, Clone, PartialEq)]
pub struct StochasticColumns {
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
}

pub fn calculate_stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> StochasticColumns {
    let n = bars.len();
    let mut k = vec![None; n];

    if k_period > 0 {
        for i in (k_period - 1)..n {
            let window = &bars[i + 1 - k_period..=i];
            let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let range = highest - lowest;
            k[i] = Some(if range == 0.0 {
                50.0
            } else {
                (bars[i].close - lowest) / range * 100.0
            });
        }
    }

    let d = match k.iter().position(Option::is_some) {
        Some(first) => {
            let defined: Vec<f64> = k[first..].iter().map(|v| v.unwrap_or(0.0)).collect();
            let mut d = vec![None; first];
            d.extend(calculate_sma(&defined, d_period));
            d
        }
        None => vec![None; n],
    };

    StochasticColumns { k, d }
}
