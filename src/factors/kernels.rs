//! Scalar kernels for the price-series factors.
//!
//! Every backend computes these quantities with the same recurrences; the
//! polars backends express them as column operations, the native backend
//! calls these functions directly. Division by zero and other undefined
//! regions flow through IEEE arithmetic and are filtered to null at the
//! table boundary via [`finite32`].

pub const ANNUALISATION: f64 = 252.0;

/// f64 -> Option<f32>, dropping NaN and infinities.
pub fn finite32(v: f64) -> Option<f32> {
    if v.is_finite() {
        Some(v as f32)
    } else {
        None
    }
}

/// Daily percent returns; first element is undefined (NaN).
pub fn daily_returns(closes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(closes.len());
    out.push(f64::NAN);
    for i in 1..closes.len() {
        out.push(closes[i] / closes[i - 1] - 1.0);
    }
    out
}

/// close / close[len-1-n] - 1, in percent. When fewer than `n` prior rows
/// exist the earliest available close is the base, so a freshly listed
/// stock reads 0% rather than undefined.
pub fn pct_change_last(closes: &[f64], n: usize) -> f64 {
    if closes.is_empty() {
        return f64::NAN;
    }
    let last = closes[closes.len() - 1];
    let base_idx = closes.len().saturating_sub(n + 1);
    let base = closes[base_idx];
    (last / base - 1.0) * 100.0
}

pub fn sma_last(values: &[f64], window: usize) -> f64 {
    if values.len() < window || window == 0 {
        return f64::NAN;
    }
    let tail = &values[values.len() - window..];
    tail.iter().sum::<f64>() / window as f64
}

/// Sample standard deviation (ddof = 1) over the trailing window.
pub fn std_last(values: &[f64], window: usize) -> f64 {
    if values.len() < window || window < 2 {
        return f64::NAN;
    }
    let tail = &values[values.len() - window..];
    let mean = tail.iter().sum::<f64>() / window as f64;
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0);
    var.sqrt()
}

pub fn min_last(values: &[f64], window: usize) -> f64 {
    if values.len() < window || window == 0 {
        return f64::NAN;
    }
    values[values.len() - window..]
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min)
}

pub fn max_last(values: &[f64], window: usize) -> f64 {
    if values.len() < window || window == 0 {
        return f64::NAN;
    }
    values[values.len() - window..]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Span-parameterised EMA, adjust = false: e_t = a*v_t + (1-a)*e_{t-1},
/// a = 2/(span+1), seeded with the first value.
pub fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    ewm_series(values, 2.0 / (span as f64 + 1.0))
}

/// Alpha-parameterised exponential moving average, adjust = false.
pub fn ewm_series(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut state = f64::NAN;
    for &v in values {
        if state.is_nan() {
            state = v;
        } else {
            state = alpha * v + (1.0 - alpha) * state;
        }
        out.push(state);
    }
    out
}

/// Annualised volatility of the trailing `window` daily returns, percent.
pub fn volatility_last(closes: &[f64], window: usize) -> f64 {
    let rets = daily_returns(closes);
    if rets.len() < window + 1 {
        return f64::NAN;
    }
    std_last(&rets[1..], window) * ANNUALISATION.sqrt() * 100.0
}

/// Annualised downside volatility: population-style variance of the
/// negative returns within the trailing window (divisor = window size).
pub fn downside_volatility_last(closes: &[f64], window: usize) -> f64 {
    let rets = daily_returns(closes);
    if rets.len() < window + 1 {
        return f64::NAN;
    }
    let tail = &rets[rets.len() - window..];
    let sum_sq: f64 = tail.iter().filter(|r| **r < 0.0).map(|r| r * r).sum();
    (sum_sq / window as f64).sqrt() * ANNUALISATION.sqrt() * 100.0
}

/// Worst peak-to-trough of the trailing `window` closes, percent (>= 0).
pub fn max_drawdown_last(closes: &[f64], window: usize) -> f64 {
    if closes.is_empty() {
        return f64::NAN;
    }
    let start = closes.len().saturating_sub(window);
    let tail = &closes[start..];
    let mut peak = tail[0];
    let mut worst = 0.0f64;
    for &v in tail {
        if v > peak {
            peak = v;
        }
        let dd = (peak - v) / peak * 100.0;
        if dd > worst {
            worst = dd;
        }
    }
    worst
}

/// Trailing-window annualised Sharpe of daily returns (risk-free = 0).
pub fn sharpe_last(closes: &[f64], window: usize) -> f64 {
    let rets = daily_returns(closes);
    if rets.len() < window + 1 {
        return f64::NAN;
    }
    let tail = &rets[rets.len() - window..];
    let mean = tail.iter().sum::<f64>() / window as f64;
    let std = std_last(tail, window);
    (mean * ANNUALISATION) / (std * ANNUALISATION.sqrt())
}

/// 60-day beta of stock returns against market returns (sample cov / var).
/// Slices must be aligned and the same length.
pub fn beta_last(stock_closes: &[f64], market_returns: &[f64], window: usize) -> f64 {
    let stock_rets = daily_returns(stock_closes);
    if stock_rets.len() < window + 1 || market_returns.len() < window {
        return f64::NAN;
    }
    let s = &stock_rets[stock_rets.len() - window..];
    let m = &market_returns[market_returns.len() - window..];
    let ms = s.iter().sum::<f64>() / window as f64;
    let mm = m.iter().sum::<f64>() / window as f64;
    let mut cov = 0.0;
    let mut var = 0.0;
    for i in 0..window {
        cov += (s[i] - ms) * (m[i] - mm);
        var += (m[i] - mm).powi(2);
    }
    cov / var
}

/// 14-day Wilder RSI: exponential smoothing of gains and losses with
/// alpha = 1/period, adjust = false, first diff treated as zero.
pub fn rsi_wilder_last(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return f64::NAN;
    }
    let mut gains = Vec::with_capacity(closes.len());
    let mut losses = Vec::with_capacity(closes.len());
    gains.push(0.0);
    losses.push(0.0);
    for i in 1..closes.len() {
        let change = closes[i] - closes[i - 1];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }
    let alpha = 1.0 / period as f64;
    let avg_gain = *ewm_series(&gains, alpha).last().unwrap();
    let avg_loss = *ewm_series(&losses, alpha).last().unwrap();
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// MACD line, signal and histogram at the end of the series.
pub fn macd_last(closes: &[f64]) -> (f64, f64, f64) {
    if closes.len() < 26 {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let ema12 = ema_series(closes, 12);
    let ema26 = ema_series(closes, 26);
    let macd: Vec<f64> = ema12
        .iter()
        .zip(ema26.iter())
        .map(|(a, b)| a - b)
        .collect();
    let signal = ema_series(&macd, 9);
    let line = *macd.last().unwrap();
    let sig = *signal.last().unwrap();
    (line, sig, line - sig)
}

/// 14-day stochastic %K: (close - min) / (max - min) * 100.
pub fn stochastic_last(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period {
        return f64::NAN;
    }
    let close = *closes.last().unwrap();
    let lo = min_last(closes, period);
    let hi = max_last(closes, period);
    (close - lo) / (hi - lo) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    fn closes() -> Vec<f64> {
        vec![
            100.0, 102.0, 101.0, 103.0, 105.0, 104.0, 106.0, 108.0, 107.0, 110.0, 109.0, 112.0,
            111.0, 113.0, 115.0, 114.0, 116.0, 118.0, 117.0, 120.0, 119.0, 122.0, 121.0, 123.0,
            125.0, 124.0, 126.0, 128.0, 127.0, 130.0,
        ]
    }

    #[test]
    fn pct_change_window() {
        let c = [100.0, 110.0, 121.0];
        assert!((pct_change_last(&c, 1) - 10.0).abs() < TOL);
        assert!((pct_change_last(&c, 2) - 21.0).abs() < TOL);
        // Short history clamps to the earliest close.
        assert!((pct_change_last(&c, 5) - 21.0).abs() < TOL);
        assert!((pct_change_last(&c[..1], 20) - 0.0).abs() < TOL);
        assert!(pct_change_last(&[], 1).is_nan());
    }

    #[test]
    fn sma_and_std() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((sma_last(&v, 3) - 4.0).abs() < TOL);
        // std of [3,4,5], ddof=1 = 1.0
        assert!((std_last(&v, 3) - 1.0).abs() < TOL);
        assert!(std_last(&v, 6).is_nan());
    }

    #[test]
    fn ema_recurrence() {
        let v = [10.0, 20.0, 30.0];
        // span 3 => alpha 0.5; e = 10, 15, 22.5
        let e = ema_series(&v, 3);
        assert!((e[2] - 22.5).abs() < TOL);
    }

    #[test]
    fn rsi_bounds_and_direction() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + f64::from(i)).collect();
        let rsi = rsi_wilder_last(&up, 14);
        assert!((rsi - 100.0).abs() < TOL, "all gains -> RSI 100, got {rsi}");

        let down: Vec<f64> = (0..30).map(|i| 100.0 - f64::from(i)).collect();
        let rsi = rsi_wilder_last(&down, 14);
        assert!(rsi.abs() < TOL, "all losses -> RSI 0, got {rsi}");

        let mixed = rsi_wilder_last(&closes(), 14);
        assert!(mixed > 50.0 && mixed < 100.0, "uptrend RSI in (50,100), got {mixed}");
    }

    #[test]
    fn rsi_flat_series_is_nan() {
        let flat = vec![100.0; 30];
        assert!(rsi_wilder_last(&flat, 14).is_nan());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let (line, signal, hist) = macd_last(&closes());
        assert!(line > 0.0);
        assert!((line - signal - hist).abs() < TOL);
    }

    #[test]
    fn stochastic_at_extremes() {
        let mut c = closes();
        assert!(stochastic_last(&c, 14) > 80.0);
        c.push(100.0); // collapse to the low end of the window
        assert!(stochastic_last(&c, 14) < 20.0);
    }

    #[test]
    fn max_drawdown_known_path() {
        let c = [100.0, 120.0, 90.0, 110.0];
        // peak 120 -> trough 90 = 25%
        assert!((max_drawdown_last(&c, 4) - 25.0).abs() < TOL);
    }

    #[test]
    fn volatility_flat_is_zero() {
        let flat = vec![100.0; 70];
        assert!(volatility_last(&flat, 60).abs() < TOL);
    }

    #[test]
    fn downside_volatility_zero_when_no_losses() {
        let up: Vec<f64> = (0..70).map(|i| 100.0 + f64::from(i)).collect();
        assert!(downside_volatility_last(&up, 60).abs() < TOL);
    }

    #[test]
    fn beta_of_market_is_one() {
        let closes: Vec<f64> = (0..70).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let market = daily_returns(&closes)[1..].to_vec();
        let beta = beta_last(&closes, &market, 60);
        // Constant returns make var 0; perturb to get a usable series.
        if beta.is_nan() {
            let mut wiggly = Vec::new();
            for (i, c) in closes.iter().enumerate() {
                wiggly.push(c * (1.0 + 0.001 * f64::from(i as i32 % 3)));
            }
            let market = daily_returns(&wiggly)[1..].to_vec();
            let beta = beta_last(&wiggly, &market, 60);
            assert!((beta - 1.0).abs() < 1e-6);
        } else {
            assert!((beta - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn finite32_filters() {
        assert_eq!(finite32(1.5), Some(1.5));
        assert_eq!(finite32(f64::NAN), None);
        assert_eq!(finite32(f64::INFINITY), None);
    }
}
