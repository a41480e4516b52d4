//! MACD (Moving Average Convergence Divergence).
//!
//! MACD Line = EMA(fast) - EMA(slow)
//! Signal Line = EMA(signal) of MACD Line, seeded with the SMA of its first
//! `signal` defined values
//! Histogram = MACD Line - Signal Line
//!
//! Default parameters: fast=12, slow=26, signal=9
//! Warmup: line undefined before slow-1; signal and histogram undefined
//! before slow-1 + signal-1.

use super::ema::calculate_ema;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct MacdColumns {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

pub fn calculate_macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdColumns {
    let n = values.len();
    let ema_fast = calculate_ema(values, fast);
    let ema_slow = calculate_ema(values, slow);

    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let mut signal = vec![None; n];
    if signal_period > 0 {
        if let Some(first) = line.iter().position(Option::is_some) {
            let seed_end = first + signal_period;
            if seed_end <= n {
                let k = 2.0 / (signal_period as f64 + 1.0);
                let mut signal_ema = line[first..seed_end]
                    .iter()
                    .map(|v| v.unwrap_or(0.0))
                    .sum::<f64>()
                    / signal_period as f64;
                signal[seed_end - 1] = Some(signal_ema);

                for i in seed_end..n {
                    if let Some(l) = line[i] {
                        signal_ema = l * k + signal_ema * (1.0 - k);
                        signal[i] = Some(signal_ema);
                    }
                }
            }
        }
    }

    let histogram = line
        .iter()
        .zip(&signal)
        .map(|(l, s)| Some((*l)? - (*s)?))
        .collect();

    MacdColumns {
        line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn macd_warmup_lengths() {
        let out = calculate_macd(&rising(40), 3, 6, 4);
        assert!(out.line[4].is_none());
        assert!(out.line[5].is_some());
        // signal: slow-1 + signal-1 = 5 + 3 = 8
        assert!(out.signal[7].is_none());
        assert!(out.signal[8].is_some());
        assert!(out.histogram[7].is_none());
        assert!(out.histogram[8].is_some());
    }

    #[test]
    fn macd_line_is_ema_difference() {
        let prices = rising(20);
        let out = calculate_macd(&prices, 3, 6, 4);
        let fast = calculate_ema(&prices, 3);
        let slow = calculate_ema(&prices, 6);
        for i in 5..20 {
            let expected = fast[i].unwrap() - slow[i].unwrap();
            assert!((out.line[i].unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_signal_seeded_with_sma() {
        let prices = rising(20);
        let out = calculate_macd(&prices, 3, 6, 4);
        let seed: f64 = (5..9).map(|i| out.line[i].unwrap()).sum::<f64>() / 4.0;
        assert!((out.signal[8].unwrap() - seed).abs() < 1e-12);
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let prices: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let out = calculate_macd(&prices, DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL);
        for i in 0..50 {
            if let (Some(l), Some(s), Some(h)) = (out.line[i], out.signal[i], out.histogram[i]) {
                assert!((h - (l - s)).abs() < 1e-12);
            }
        }
        assert!(out.histogram[DEFAULT_SLOW + DEFAULT_SIGNAL - 2].is_some());
    }

    #[test]
    fn macd_short_input_is_undefined() {
        let out = calculate_macd(&rising(5), 12, 26, 9);
        assert!(out.line.iter().all(Option::is_none));
        assert!(out.signal.iter().all(Option::is_none));
    }
}
