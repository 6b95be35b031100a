use analysis_core::StrategyPerformance;

const WEIGHT_WIN_RATE: f64 = 0.25;
const WEIGHT_PNL: f64 = 0.20;
const WEIGHT_SHARPE: f64 = 0.20;
const WEIGHT_CONSISTENCY: f64 = 0.15;
const WEIGHT_DRAWDOWN: f64 = 0.10;
const WEIGHT_VOLUME: f64 = 0.10;

/// Points per trade for strategies that have not reached the minimum
/// sample; keeps young strategies ranked below established ones.
const COLD_START_POINTS_PER_TRADE: f64 = 5.0;

/// Composite 0..100 score of a strategy's track record.
///
/// Below `min_trades` the score is `trades * 5` so that scoring stays
/// monotone in sample size until the real formula applies.
pub fn composite_score(perf: &StrategyPerformance, min_trades: u32) -> f64 {
    if perf.total_trades < min_trades {
        return perf.total_trades as f64 * COLD_START_POINTS_PER_TRADE;
    }

    let win_rate = perf.win_rate * 100.0;
    let pnl = ((perf.avg_pnl / 100.0).tanh() + 1.0) * 50.0;
    let sharpe = ((perf.sharpe_ratio / 2.0).clamp(-1.0, 1.0) + 1.0) * 50.0;
    let consistency = (70.0 + 5.0 * perf.consecutive_wins as f64
        - 15.0 * perf.consecutive_losses as f64)
        .clamp(0.0, 100.0);
    let drawdown = 100.0 / (1.0 + perf.max_drawdown.max(0.0) / 500.0);
    let volume = (perf.total_trades as f64 * 2.0).min(100.0);

    let score = WEIGHT_WIN_RATE * win_rate
        + WEIGHT_PNL * pnl
        + WEIGHT_SHARPE * sharpe
        + WEIGHT_CONSISTENCY * consistency
        + WEIGHT_DRAWDOWN * drawdown
        + WEIGHT_VOLUME * volume;

    score.clamp(0.0, 100.0)
}
