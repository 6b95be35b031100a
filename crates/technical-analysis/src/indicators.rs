use analysis_core::stats::population_std_dev;
use analysis_core::Bar;

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let sum: f64 = data[i + 1 - period..=i].iter().sum();
        result.push(sum / period as f64);
    }
    result
}

/// Exponential Moving Average, seeded with the SMA of the first `period` values.
///
/// `result[k]` corresponds to `data[period - 1 + k]`.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len() - period + 1);

    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    result.push(seed);

    for value in &data[period..] {
        let prev = result[result.len() - 1];
        result.push((value - prev) * multiplier + prev);
    }

    result
}

/// Relative Strength Index (Wilder smoothing)
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period + 1 {
        return vec![];
    }

    let mut gains = Vec::with_capacity(data.len() - 1);
    let mut losses = Vec::with_capacity(data.len() - 1);

    for i in 1..data.len() {
        let change = data[i] - data[i - 1];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(change.abs());
        }
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    let mut rsi_values = Vec::with_capacity(gains.len() - period + 1);
    rsi_values.push(rsi_from_averages(avg_gain, avg_loss));

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
        rsi_values.push(rsi_from_averages(avg_gain, avg_loss));
    }

    rsi_values
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // flat series is neutral, pure gains saturate
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// MACD series aligned to the slow EMA.
///
/// The signal line is the slow EMA itself rather than an EMA of the MACD
/// line. Confidence thresholds downstream were tuned against this variant;
/// do not swap in the textbook 9-period signal without re-tuning them.
pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(data: &[f64], fast_period: usize, slow_period: usize) -> MacdResult {
    if fast_period == 0 || slow_period < fast_period || data.len() < slow_period {
        return MacdResult { macd_line: vec![], signal_line: vec![], histogram: vec![] };
    }

    let ema_fast = ema(data, fast_period);
    let ema_slow = ema(data, slow_period);

    // ema_fast starts (slow - fast) bars earlier than ema_slow
    let offset = slow_period - fast_period;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow)| ema_fast[i + offset] - slow)
        .collect();

    let histogram = macd_line
        .iter()
        .zip(&ema_slow)
        .map(|(m, s)| m - s)
        .collect();

    MacdResult {
        macd_line,
        signal_line: ema_slow,
        histogram,
    }
}

/// Bollinger Bands
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    if period == 0 || data.len() < period {
        return BollingerBands { upper: vec![], middle: vec![], lower: vec![] };
    }

    let middle = sma(data, period);
    let mut upper = Vec::with_capacity(middle.len());
    let mut lower = Vec::with_capacity(middle.len());

    for (k, i) in (period - 1..data.len()).enumerate() {
        let std = population_std_dev(&data[i + 1 - period..=i]);
        upper.push(middle[k] + std_dev * std);
        lower.push(middle[k] - std_dev * std);
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// True range of each bar after the first.
pub fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            let high_low = bar.high - bar.low;
            let high_close = (bar.high - prev.close).abs();
            let low_close = (bar.low - prev.close).abs();
            high_low.max(high_close).max(low_close)
        })
        .collect()
}

/// Average True Range: plain mean of the true range over each trailing window.
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period + 1 {
        return vec![];
    }
    sma(&true_ranges(bars), period)
}

/// Fractional change over `period` bars: close[t] / close[t - period] - 1.
pub fn rate_of_change(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() <= period {
        return None;
    }
    let current = data[data.len() - 1];
    let past = data[data.len() - 1 - period];
    if past == 0.0 {
        return None;
    }
    Some(current / past - 1.0)
}

/// Last bar's volume relative to the mean of the `period` bars before it.
pub fn volume_ratio(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let last = bars.len() - 1;
    let avg = bars[last - period..last].iter().map(|b| b.volume).sum::<f64>() / period as f64;
    if avg <= 0.0 {
        return None;
    }
    Some(bars[last].volume / avg)
}

/// Highest high and lowest low of the `lookback` bars preceding the last bar.
pub struct PriceChannel {
    pub upper: f64,
    pub lower: f64,
}

pub fn prior_channel(bars: &[Bar], lookback: usize) -> Option<PriceChannel> {
    if lookback == 0 || bars.len() < lookback + 1 {
        return None;
    }
    let last = bars.len() - 1;
    let window = &bars[last - lookback..last];
    let upper = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let lower = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    Some(PriceChannel { upper, lower })
}
