use std::collections::BTreeMap;

use analysis_core::stats::z_score_of;
use analysis_core::Bar;
use technical_analysis as ta;

/// Indicator values every strategy reads, computed once per bar series.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    pub atr: f64,
    pub volume_ratio: f64,
    pub roc_10: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub zscore_20: f64,
    pub channel_high: f64,
    pub channel_low: f64,
}

fn last_or(values: &[f64], fallback: f64) -> f64 {
    values.last().copied().unwrap_or(fallback)
}

impl IndicatorSnapshot {
    /// Callers guarantee at least [`crate::MIN_BARS`] bars; shorter series
    /// fall back to neutral values rather than panicking.
    pub fn compute(bars: &[Bar]) -> Self {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let close = last_or(&closes, 0.0);

        let macd = ta::macd(&closes, 12, 26);
        let bands = ta::bollinger_bands(&closes, 20, 2.0);
        let channel = ta::prior_channel(bars, 20);
        let tail = &closes[closes.len().saturating_sub(20)..];

        Self {
            close,
            rsi: last_or(&ta::rsi(&closes, 14), 50.0),
            macd: last_or(&macd.macd_line, 0.0),
            macd_signal: last_or(&macd.signal_line, close),
            macd_histogram: last_or(&macd.histogram, 0.0),
            sma_20: last_or(&ta::sma(&closes, 20), close),
            sma_50: last_or(&ta::sma(&closes, 50), close),
            atr: last_or(&ta::atr(bars, 14), 0.0),
            volume_ratio: ta::volume_ratio(bars, 20).unwrap_or(1.0),
            roc_10: ta::rate_of_change(&closes, 10).unwrap_or(0.0),
            bb_upper: last_or(&bands.upper, close),
            bb_middle: last_or(&bands.middle, close),
            bb_lower: last_or(&bands.lower, close),
            zscore_20: z_score_of(close, tail),
            channel_high: channel.as_ref().map(|c| c.upper).unwrap_or(close),
            channel_low: channel.as_ref().map(|c| c.lower).unwrap_or(close),
        }
    }

    /// ATR as a fraction of price
    pub fn relative_volatility(&self) -> f64 {
        if self.close <= 0.0 {
            return 0.0;
        }
        self.atr / self.close
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        [
            ("close", self.close),
            ("rsi", self.rsi),
            ("macd", self.macd),
            ("macd_signal", self.macd_signal),
            ("macd_histogram", self.macd_histogram),
            ("sma_20", self.sma_20),
            ("sma_50", self.sma_50),
            ("atr", self.atr),
            ("volume_ratio", self.volume_ratio),
            ("roc_10", self.roc_10),
            ("bb_upper", self.bb_upper),
            ("bb_middle", self.bb_middle),
            ("bb_lower", self.bb_lower),
            ("zscore_20", self.zscore_20),
            ("channel_high", self.channel_high),
            ("channel_low", self.channel_low),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}
