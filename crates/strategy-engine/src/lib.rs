pub mod backtest;
pub mod evaluator;
pub mod exits;
pub mod scorer;
pub mod scoring;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use backtest::{backtest, BacktestConfig, BacktestReport, BacktestTrade};
pub use evaluator::{StrategyEvaluator, MIN_BARS};
pub use exits::{classify_exit, realized_pnl, ExitDecision, ExitLevels, ExitReason};
pub use scorer::{
    MultiStrategyAnalysis, MultiStrategyScorer, NoHistory, PerformanceSource, ScorerConfig,
    StrategyScore, StrategySwitch,
};
pub use scoring::composite_score;
pub use snapshot::IndicatorSnapshot;
