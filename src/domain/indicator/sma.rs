//! Simple Moving Average.
//!
//! SMA(n)[i] = mean(v[i-n+1..=i]). Warmup: first (n-1) rows are undefined.

pub fn calculate_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }

    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        out[i] = Some(window.iter().sum::<f64>() / period as f64);
    }
    out
}
