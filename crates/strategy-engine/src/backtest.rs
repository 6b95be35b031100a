use analysis_core::{AnalysisError, Bar, SignalAction, StrategyKind, StrategyPerformance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluator::{StrategyEvaluator, MIN_BARS};
use crate::exits::{classify_exit, realized_pnl, ExitDecision, ExitLevels, ExitReason};

/// Configuration for a single-strategy walk-forward run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Bars before the first evaluation; never below [`MIN_BARS`]
    pub warmup: usize,
    /// Bars a position may stay open before it is closed at the close
    pub max_holding_bars: usize,
    pub notional_per_trade: f64,
    pub min_confidence: f64,
    pub testing_window: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            warmup: MIN_BARS,
            max_holding_bars: 10,
            notional_per_trade: 1_000.0,
            min_confidence: 0.60,
            testing_window: 7,
        }
    }
}

/// A round-trip trade (entry + exit) from the backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub side: SignalAction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub confidence: f64,
    pub exit_reason: ExitReason,
    pub bars_held: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub strategy: StrategyKind,
    pub symbol: String,
    pub bars_evaluated: usize,
    pub trades: Vec<BacktestTrade>,
    /// Folded with the same update the live learning loop uses
    pub performance: StrategyPerformance,
}

struct OpenTrade {
    levels: ExitLevels,
    entry_index: usize,
    quantity: f64,
    confidence: f64,
}

/// Walk forward over `bars`, evaluating `kind` on every prefix once warm.
///
/// One simulated position at a time. Entries fill at the signal bar's close;
/// exits go through [`classify_exit`] on each later bar, falling back to the
/// close once `max_holding_bars` have passed. A position still open when the
/// data ends is closed at the final close.
pub fn backtest(
    kind: StrategyKind,
    symbol: &str,
    bars: &[Bar],
    config: &BacktestConfig,
) -> Result<BacktestReport, AnalysisError> {
    let warmup = config.warmup.max(MIN_BARS);
    if bars.len() < warmup + 1 {
        return Err(AnalysisError::InsufficientData {
            required: warmup + 1,
            actual: bars.len(),
        });
    }

    let mut performance = StrategyPerformance::new(kind.id());
    let mut trades = Vec::new();
    let mut open: Option<OpenTrade> = None;
    let mut bars_evaluated = 0;

    for i in warmup - 1..bars.len() {
        if let Some(position) = open.as_ref() {
            let bar = &bars[i];
            let held = i - position.entry_index;
            let decision = classify_exit(&position.levels, bar).or_else(|| {
                (held >= config.max_holding_bars).then_some(ExitDecision {
                    reason: ExitReason::Horizon,
                    price: bar.close,
                })
            });
            if let Some(decision) = decision {
                let trade = close_trade(position, bars, i, decision);
                performance.apply_trade(trade.pnl, config.testing_window);
                trades.push(trade);
                open = None;
            }
            continue;
        }

        let signal = kind.evaluate(symbol, &bars[..=i])?;
        bars_evaluated += 1;

        // no room left to exit
        if i + 1 >= bars.len() || signal.confidence < config.min_confidence {
            continue;
        }
        if let Some(levels) = ExitLevels::from_signal(&signal) {
            if levels.entry_price <= 0.0 {
                continue;
            }
            open = Some(OpenTrade {
                quantity: config.notional_per_trade / levels.entry_price,
                levels,
                entry_index: i,
                confidence: signal.confidence,
            });
        }
    }

    if let Some(position) = open.take() {
        let last = bars.len() - 1;
        let decision = ExitDecision {
            reason: ExitReason::Horizon,
            price: bars[last].close,
        };
        let trade = close_trade(&position, bars, last, decision);
        performance.apply_trade(trade.pnl, config.testing_window);
        trades.push(trade);
    }

    tracing::debug!(
        strategy = kind.id(),
        symbol,
        trades = trades.len(),
        win_rate = performance.win_rate,
        total_pnl = performance.total_pnl,
        "Backtest complete"
    );

    Ok(BacktestReport {
        strategy: kind,
        symbol: symbol.to_string(),
        bars_evaluated,
        trades,
        performance,
    })
}

fn close_trade(
    position: &OpenTrade,
    bars: &[Bar],
    exit_index: usize,
    decision: ExitDecision,
) -> BacktestTrade {
    let levels = &position.levels;
    BacktestTrade {
        side: levels.side,
        entry_time: bars[position.entry_index].timestamp,
        exit_time: bars[exit_index].timestamp,
        entry_price: levels.entry_price,
        exit_price: decision.price,
        quantity: position.quantity,
        pnl: realized_pnl(levels.side, levels.entry_price, decision.price, position.quantity),
        confidence: position.confidence,
        exit_reason: decision.reason,
        bars_held: exit_index - position.entry_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bars_from_closes, rising_bars};

    #[test]
    fn needs_warmup_plus_one_bar() {
        let err = backtest(StrategyKind::Momentum, "AAPL", &rising_bars(50), &BacktestConfig::default())
            .unwrap_err();
        assert_eq!(err, AnalysisError::InsufficientData { required: 51, actual: 50 });
    }

    #[test]
    fn uptrend_momentum_takes_profits() {
        let report =
            backtest(StrategyKind::Momentum, "AAPL", &rising_bars(120), &BacktestConfig::default())
                .unwrap();
        assert!(!report.trades.is_empty());
        for trade in &report.trades {
            assert_eq!(trade.side, SignalAction::Buy);
            assert!(trade.pnl > 0.0);
        }
        assert_eq!(report.trades[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(report.performance.total_trades as usize, report.trades.len());
        assert_eq!(report.performance.win_rate, 1.0);
    }

    #[test]
    fn open_position_closed_at_end_of_data() {
        let report =
            backtest(StrategyKind::Momentum, "AAPL", &rising_bars(52), &BacktestConfig::default())
                .unwrap();
        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Horizon);
        assert_eq!(trade.exit_price, 151.0);
        assert_eq!(trade.bars_held, 2);
    }

    #[test]
    fn flat_market_never_trades() {
        let bars = bars_from_closes(&[100.0; 80]);
        let report = backtest(StrategyKind::Breakout, "SPY", &bars, &BacktestConfig::default()).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.bars_evaluated, 31);
        assert_eq!(report.performance.total_trades, 0);
    }

    #[test]
    fn reruns_are_identical() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.21).sin() * 12.0)
            .collect();
        let bars = bars_from_closes(&closes);
        let config = BacktestConfig::default();
        for kind in StrategyKind::ALL {
            let a = backtest(kind, "QQQ", &bars, &config).unwrap();
            let b = backtest(kind, "QQQ", &bars, &config).unwrap();
            assert_eq!(a.trades, b.trades);
            assert_eq!(a.performance.total_pnl, b.performance.total_pnl);
        }
    }
}
