//! Rolling population standard deviation.
//!
//! STDDEV(n)[i] = sqrt(sum((v[i-j] - SMA(n)[i])^2 for j in 0..n) / n)
//! Warmup: first (n-1) rows are undefined.

pub fn calculate_stddev(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }

    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window
            .iter()
            .map(|v| {
                let diff = v - mean;
                diff * diff
            })
            .sum::<f64>()
            / period as f64;
        out[i] = Some(variance.sqrt());
    }
    out
}
