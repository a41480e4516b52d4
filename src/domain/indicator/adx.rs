//! ADX (Average Directional Index) with +DI / -DI.
//!
//! +DM/-DM and TR are Wilder-smoothed over n (seed = sum of the first n
//! values from row 1). DI = 100 * smoothed DM / smoothed TR, 0 when the
//! smoothed TR is 0. DX = 100 * |+DI - -DI| / (+DI + -DI), 0 when the sum is 0.
//! ADX seed = mean of the first n DX values, then Wilder smoothing.
//!
//! Warmup: DI undefined before row n, ADX undefined before row 2n-1.

use crate::domain::ohlcv::Bar;

#[derive(Debug, Clone, PartialEq)]
pub struct AdxColumns {
    pub adx: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
}

pub fn calculate_adx(bars: &[Bar], period: usize) -> AdxColumns {
    let n = bars.len();
    let mut out = AdxColumns {
        adx: vec![None; n],
        plus_di: vec![None; n],
        minus_di: vec![None; n],
    };
    if period == 0 || n <= period {
        return out;
    }

    let mut tr = vec![0.0; n];
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up = bars[i].high - bars[i - 1].high;
        let down = bars[i - 1].low - bars[i].low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
        tr[i] = bars[i].true_range(bars[i - 1].close);
    }

    let p = period as f64;
    let mut s_tr: f64 = tr[1..=period].iter().sum();
    let mut s_plus: f64 = plus_dm[1..=period].iter().sum();
    let mut s_minus: f64 = minus_dm[1..=period].iter().sum();

    let mut dx = vec![0.0; n];
    for i in period..n {
        if i > period {
            s_tr = s_tr - s_tr / p + tr[i];
            s_plus = s_plus - s_plus / p + plus_dm[i];
            s_minus = s_minus - s_minus / p + minus_dm[i];
        }
        let (pdi, mdi) = if s_tr == 0.0 {
            (0.0, 0.0)
        } else {
            (100.0 * s_plus / s_tr, 100.0 * s_minus / s_tr)
        };
        out.plus_di[i] = Some(pdi);
        out.minus_di[i] = Some(mdi);
        let sum = pdi + mdi;
        dx[i] = if sum == 0.0 { 0.0 } else { 100.0 * (pdi - mdi).abs() / sum };
    }

    let first_adx = 2 * period - 1;
    if first_adx < n {
        let mut adx = dx[period..=first_adx].iter().sum::<f64>() / p;
        out.adx[first_adx] = Some(adx);
        for i in (first_adx + 1)..n {
            adx = (adx * (p - 1.0) + dx[i]) / p;
            out.adx[i] = Some(adx);
        }
    }
    out
}
