use analysis_core::{AnalysisError, Bar, Signal, SignalAction, StrategyKind};
use chrono::Utc;

use crate::snapshot::IndicatorSnapshot;

/// Minimum bar count before any strategy will evaluate (indicator warmup).
pub const MIN_BARS: usize = 50;

const BASE_CONFIDENCE: f64 = 0.5;
const MIN_CONFIDENCE: f64 = 0.30;
const MAX_CONFIDENCE: f64 = 0.95;

/// ATR multiples for protective levels
const STOP_ATR_MULTIPLE: f64 = 2.0;
const TARGET_ATR_MULTIPLE: f64 = 3.0;
/// Percent levels used when ATR is degenerate (flat series)
const FALLBACK_STOP_PCT: f64 = 0.05;
const FALLBACK_TARGET_PCT: f64 = 0.10;

/// Produces one directional signal from a bar series.
///
/// Implementations are pure: the same bars always yield the same signal
/// (apart from `timestamp`).
pub trait StrategyEvaluator {
    fn evaluate(&self, symbol: &str, bars: &[Bar]) -> Result<Signal, AnalysisError>;
}

impl StrategyEvaluator for StrategyKind {
    fn evaluate(&self, symbol: &str, bars: &[Bar]) -> Result<Signal, AnalysisError> {
        if bars.len() < MIN_BARS {
            return Err(AnalysisError::InsufficientData {
                required: MIN_BARS,
                actual: bars.len(),
            });
        }
        if bars.iter().any(|b| !b.close.is_finite() || b.close <= 0.0) {
            return Err(AnalysisError::InvalidData(format!(
                "{}: non-positive or non-finite close in bar series",
                symbol
            )));
        }

        let snap = IndicatorSnapshot::compute(bars);
        let (action, reason) = match self {
            StrategyKind::Momentum => momentum(&snap),
            StrategyKind::MeanReversion => mean_reversion(&snap),
            StrategyKind::Breakout => breakout(&snap),
            StrategyKind::Technical => technical(&snap),
            StrategyKind::EnhancedMeanReversion => enhanced_mean_reversion(&snap),
        };

        let confidence = score_confidence(action, &snap);
        let (stop_loss, take_profit) = match self {
            StrategyKind::EnhancedMeanReversion => reversion_levels(action, &snap),
            _ => atr_levels(action, &snap),
        };

        Ok(Signal {
            symbol: symbol.to_string(),
            action,
            confidence,
            strategy: *self,
            timestamp: Utc::now(),
            entry_price: snap.close,
            stop_loss,
            take_profit,
            indicators: snap.to_map(),
            reason,
        })
    }
}

/// 10-bar rate of change confirmed by price relative to SMA(20).
fn momentum(s: &IndicatorSnapshot) -> (SignalAction, String) {
    if s.roc_10 > 0.02 && s.close > s.sma_20 {
        (
            SignalAction::Buy,
            format!("Momentum: 10-bar ROC {:+.1}% with price above SMA20", s.roc_10 * 100.0),
        )
    } else if s.roc_10 < -0.02 && s.close < s.sma_20 {
        (
            SignalAction::Sell,
            format!("Momentum: 10-bar ROC {:+.1}% with price below SMA20", s.roc_10 * 100.0),
        )
    } else {
        (SignalAction::Hold, format!("Momentum: ROC {:+.1}% not decisive", s.roc_10 * 100.0))
    }
}

/// Fade closes outside the 20-period, 2-sigma Bollinger bands.
fn mean_reversion(s: &IndicatorSnapshot) -> (SignalAction, String) {
    if s.close < s.bb_lower {
        (
            SignalAction::Buy,
            format!("Mean reversion: close {:.2} below lower band {:.2}", s.close, s.bb_lower),
        )
    } else if s.close > s.bb_upper {
        (
            SignalAction::Sell,
            format!("Mean reversion: close {:.2} above upper band {:.2}", s.close, s.bb_upper),
        )
    } else {
        (SignalAction::Hold, "Mean reversion: price inside bands".to_string())
    }
}

/// Close beyond the prior 20-bar channel.
fn breakout(s: &IndicatorSnapshot) -> (SignalAction, String) {
    if s.close > s.channel_high {
        (
            SignalAction::Buy,
            format!("Breakout: close {:.2} above 20-bar high {:.2}", s.close, s.channel_high),
        )
    } else if s.close < s.channel_low {
        (
            SignalAction::Sell,
            format!("Breakout: close {:.2} below 20-bar low {:.2}", s.close, s.channel_low),
        )
    } else {
        (SignalAction::Hold, "Breakout: price inside 20-bar channel".to_string())
    }
}

/// RSI / MACD / SMA(50) vote; two net votes in one direction are required.
fn technical(s: &IndicatorSnapshot) -> (SignalAction, String) {
    let mut votes = 0i32;
    if s.rsi < 30.0 {
        votes += 1;
    } else if s.rsi > 70.0 {
        votes -= 1;
    }
    if s.macd > 0.0 {
        votes += 1;
    } else if s.macd < 0.0 {
        votes -= 1;
    }
    if s.close > s.sma_50 {
        votes += 1;
    } else if s.close < s.sma_50 {
        votes -= 1;
    }

    let reason = format!(
        "Technical: RSI {:.1}, MACD {:+.3}, close vs SMA50 {:+.2} (net votes {:+})",
        s.rsi,
        s.macd,
        s.close - s.sma_50,
        votes
    );
    let action = match votes {
        v if v >= 2 => SignalAction::Buy,
        v if v <= -2 => SignalAction::Sell,
        _ => SignalAction::Hold,
    };
    (action, reason)
}

/// Z-score reversion with RSI confirmation and a crash filter on SMA(50).
fn enhanced_mean_reversion(s: &IndicatorSnapshot) -> (SignalAction, String) {
    if s.zscore_20 < -1.5 && s.rsi < 40.0 && s.close > s.sma_50 * 0.90 {
        (
            SignalAction::Buy,
            format!("Enhanced reversion: z {:.2}, RSI {:.1}", s.zscore_20, s.rsi),
        )
    } else if s.zscore_20 > 1.5 && s.rsi > 60.0 && s.close < s.sma_50 * 1.10 {
        (
            SignalAction::Sell,
            format!("Enhanced reversion: z {:.2}, RSI {:.1}", s.zscore_20, s.rsi),
        )
    } else {
        (
            SignalAction::Hold,
            format!("Enhanced reversion: z {:.2} without confirmation", s.zscore_20),
        )
    }
}

/// Baseline 0.5 plus fixed bonuses for agreeing evidence, clamped to [0.30, 0.95].
pub(crate) fn score_confidence(action: SignalAction, s: &IndicatorSnapshot) -> f64 {
    if action == SignalAction::Hold {
        return BASE_CONFIDENCE;
    }

    let mut confidence = BASE_CONFIDENCE;

    // RSI extremes in the direction of the trade
    let rsi_bonus = match action {
        SignalAction::Buy if s.rsi < 30.0 => 0.15,
        SignalAction::Buy if s.rsi < 40.0 => 0.10,
        SignalAction::Sell if s.rsi > 70.0 => 0.15,
        SignalAction::Sell if s.rsi > 60.0 => 0.10,
        _ => 0.0,
    };
    confidence += rsi_bonus;

    if s.macd_histogram.abs() > 0.5 {
        confidence += 0.10;
    }

    let trend_agrees = match action {
        SignalAction::Buy => s.sma_20 > s.sma_50,
        SignalAction::Sell => s.sma_20 < s.sma_50,
        SignalAction::Hold => false,
    };
    if trend_agrees {
        confidence += 0.10;
    }

    if s.volume_ratio > 1.5 {
        confidence += 0.10;
    }

    // Very volatile tape: trust the signal less
    if s.relative_volatility() > 0.05 {
        confidence -= 0.10;
    }

    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

fn atr_levels(action: SignalAction, s: &IndicatorSnapshot) -> (Option<f64>, Option<f64>) {
    let (stop_distance, target_distance) = if s.atr > 0.0 {
        (s.atr * STOP_ATR_MULTIPLE, s.atr * TARGET_ATR_MULTIPLE)
    } else {
        (s.close * FALLBACK_STOP_PCT, s.close * FALLBACK_TARGET_PCT)
    };
    match action {
        SignalAction::Buy => (Some(s.close - stop_distance), Some(s.close + target_distance)),
        SignalAction::Sell => (Some(s.close + stop_distance), Some(s.close - target_distance)),
        SignalAction::Hold => (None, None),
    }
}

/// Reversion trades target the 20-period mean; the stop stays ATR-based.
fn reversion_levels(action: SignalAction, s: &IndicatorSnapshot) -> (Option<f64>, Option<f64>) {
    let (stop, target) = atr_levels(action, s);
    let mean_target = match action {
        SignalAction::Buy if s.sma_20 > s.close => Some(s.sma_20),
        SignalAction::Sell if s.sma_20 < s.close => Some(s.sma_20),
        _ => target,
    };
    (stop, mean_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bars_from_closes, rising_bars};

    #[test]
    fn rejects_short_series() {
        let bars = rising_bars(49);
        for kind in StrategyKind::ALL {
            let err = kind.evaluate("AAPL", &bars).unwrap_err();
            assert_eq!(
                err,
                AnalysisError::InsufficientData { required: 50, actual: 49 }
            );
        }
    }

    #[test]
    fn momentum_buys_a_steady_uptrend() {
        let bars = rising_bars(60);
        let signal = StrategyKind::Momentum.evaluate("AAPL", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.confidence >= 0.5);
        assert_eq!(signal.strategy, StrategyKind::Momentum);
        assert!(signal.stop_loss.unwrap() < signal.entry_price);
        assert!(signal.take_profit.unwrap() > signal.entry_price);
    }

    #[test]
    fn momentum_sells_a_steady_downtrend() {
        let closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let bars = bars_from_closes(&closes);
        let signal = StrategyKind::Momentum.evaluate("AAPL", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert!(signal.stop_loss.unwrap() > signal.entry_price);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.37).sin() * 6.0 + i as f64 * 0.1)
            .collect();
        let bars = bars_from_closes(&closes);
        for kind in StrategyKind::ALL {
            let a = kind.evaluate("MSFT", &bars).unwrap();
            let b = kind.evaluate("MSFT", &bars).unwrap();
            assert_eq!(a.action, b.action);
            assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
            assert_eq!(a.indicators, b.indicators);
            assert_eq!(a.stop_loss, b.stop_loss);
            assert_eq!(a.take_profit, b.take_profit);
            assert_eq!(a.reason, b.reason);
        }
    }

    #[test]
    fn confidence_stays_in_bounds() {
        let shapes: Vec<Vec<f64>> = vec![
            (0..60).map(|i| 100.0 + i as f64).collect(),
            (0..60).map(|i| 300.0 - 3.0 * i as f64).collect(),
            (0..60).map(|i| 100.0 + if i % 2 == 0 { 8.0 } else { -8.0 }).collect(),
            (0..70).map(|i| if i < 65 { 100.0 } else { 60.0 }).collect(),
            (0..70).map(|i| if i < 65 { 100.0 } else { 150.0 }).collect(),
        ];
        for closes in shapes {
            let bars = bars_from_closes(&closes);
            for kind in StrategyKind::ALL {
                let signal = kind.evaluate("TSLA", &bars).unwrap();
                assert!(
                    (0.30..=0.95).contains(&signal.confidence),
                    "{:?} produced {}",
                    kind,
                    signal.confidence
                );
            }
        }
    }

    #[test]
    fn breakout_fires_above_prior_channel() {
        let mut closes = vec![100.0; 59];
        closes.push(110.0);
        let bars = bars_from_closes(&closes);
        let signal = StrategyKind::Breakout.evaluate("NVDA", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
    }

    #[test]
    fn mean_reversion_buys_a_collapse() {
        let mut closes: Vec<f64> = (0..59).map(|i| 100.0 + (i % 3) as f64 * 0.5).collect();
        closes.push(90.0);
        let bars = bars_from_closes(&closes);
        let signal = StrategyKind::MeanReversion.evaluate("AMD", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
    }

    #[test]
    fn enhanced_reversion_targets_the_mean() {
        let mut closes: Vec<f64> = (0..57).map(|i| 100.0 + (i % 4) as f64 * 0.5).collect();
        closes.extend([98.0, 96.0, 94.0]);
        let bars = bars_from_closes(&closes);
        let signal = StrategyKind::EnhancedMeanReversion.evaluate("AMD", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        let target = signal.take_profit.unwrap();
        assert!((target - signal.indicators["sma_20"]).abs() < 1e-9);
    }

    #[test]
    fn hold_has_no_levels_and_baseline_confidence() {
        let closes = vec![100.0; 60];
        let bars = bars_from_closes(&closes);
        let signal = StrategyKind::Breakout.evaluate("SPY", &bars).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.confidence, 0.5);
        assert!(signal.stop_loss.is_none() && signal.take_profit.is_none());
    }

    #[test]
    fn rsi_bonus_requires_agreement() {
        let mut snap = IndicatorSnapshot::compute(&rising_bars(60));
        snap.macd_histogram = 0.0;
        snap.volume_ratio = 1.0;
        snap.sma_20 = snap.sma_50;
        snap.rsi = 25.0;
        assert!((score_confidence(SignalAction::Buy, &snap) - 0.65).abs() < 1e-12);
        assert!((score_confidence(SignalAction::Sell, &snap) - 0.5).abs() < 1e-12);
        snap.rsi = 35.0;
        assert!((score_confidence(SignalAction::Buy, &snap) - 0.60).abs() < 1e-12);
    }
}
