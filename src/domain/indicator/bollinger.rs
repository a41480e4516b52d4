//! Bollinger Bands.
//!
//! - Middle: SMA over n periods
//! - Upper: Middle + (multiplier × StdDev)
//! - Lower: Middle - (multiplier × StdDev)
//!
//! StdDev is the population standard deviation (divides by N, not N-1).
//! Default parameters: period=20, multiplier=2.0
//! Warmup: first (period-1) rows are undefined.

use super::sma::calculate_sma;
use super::stddev::calculate_stddev;

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerColumns {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

pub fn calculate_bollinger(values: &[f64], period: usize, stddev_mult_x100: u32) -> BollingerColumns {
    let mult = stddev_mult_x100 as f64 / 100.0;
    let middle = calculate_sma(values, period);
    let stddev = calculate_stddev(values, period);

    let upper = middle
        .iter()
        .zip(&stddev)
        .map(|(m, s)| Some((*m)? + mult * (*s)?))
        .collect();
    let lower = middle
        .iter()
        .zip(&stddev)
        .map(|(m, s)| Some((*m)? - mult * (*s)?))
        .collect();

    BollingerColumns {
        upper,
        middle,
        lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_warmup() {
        let out = calculate_bollinger(&[1.0, 2.0, 3.0, 4.0], 3, 200);
        assert!(out.upper[1].is_none());
        assert!(out.middle[1].is_none());
        assert!(out.lower[1].is_none());
        assert!(out.upper[2].is_some());
    }

    #[test]
    fn bollinger_band_widths() {
        let out = calculate_bollinger(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8, 200);
        // mean 5, population stddev 2
        assert!((out.middle[7].unwrap() - 5.0).abs() < 1e-12);
        assert!((out.upper[7].unwrap() - 9.0).abs() < 1e-12);
        assert!((out.lower[7].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bollinger_flat_prices_collapse() {
        let out = calculate_bollinger(&[50.0; 5], 3, 250);
        for i in 2..5 {
            assert_eq!(out.upper[i], out.lower[i]);
        }
    }

    #[test]
    fn bollinger_fractional_multiplier() {
        let out = calculate_bollinger(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8, 150);
        assert!((out.upper[7].unwrap() - 8.0).abs() < 1e-12);
    }
}
