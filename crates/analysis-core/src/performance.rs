use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of one closed trade by its realized P&L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcomeKind {
    Win,
    Loss,
    Breakeven,
}

impl TradeOutcomeKind {
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > 0.0 {
            TradeOutcomeKind::Win
        } else if pnl < 0.0 {
            TradeOutcomeKind::Loss
        } else {
            TradeOutcomeKind::Breakeven
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcomeKind::Win => "win",
            TradeOutcomeKind::Loss => "loss",
            TradeOutcomeKind::Breakeven => "breakeven",
        }
    }
}

/// Running statistics for one strategy.
///
/// Invariants: `winning_trades + losing_trades <= total_trades`,
/// `max_drawdown >= 0` and never decreases, at most one of the streak
/// counters is non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub strategy_id: String,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline of cumulative P&L, in dollars
    pub max_drawdown: f64,
    /// Highest cumulative P&L seen so far (starts at 0)
    pub peak_pnl: f64,
    /// Welford accumulators for the per-trade P&L variance
    pub pnl_mean: f64,
    pub pnl_m2: f64,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    /// Still inside the probation window
    pub is_testing: bool,
    pub test_trades: u32,
    pub test_wins: u32,
    pub test_pnl: f64,
    /// `None` until the probation window completes
    pub test_passed: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyPerformance {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            win_rate: 0.0,
            avg_pnl: 0.0,
            sharpe_ratio: 0.0,
            max_drawdown: 0.0,
            peak_pnl: 0.0,
            pnl_mean: 0.0,
            pnl_m2: 0.0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            is_testing: true,
            test_trades: 0,
            test_wins: 0,
            test_pnl: 0.0,
            test_passed: None,
            updated_at: Utc::now(),
        }
    }

    /// Fold one closed trade into the running statistics.
    ///
    /// `testing_window` is the number of trades the strategy spends on
    /// probation; once that many trades are recorded the window closes and
    /// `test_passed` is decided from the probation subset only.
    pub fn apply_trade(&mut self, pnl: f64, testing_window: u32) -> TradeOutcomeKind {
        let outcome = TradeOutcomeKind::from_pnl(pnl);

        if self.is_testing && testing_window == 0 {
            self.is_testing = false;
            self.test_passed = Some(true);
        }

        self.total_trades += 1;
        match outcome {
            TradeOutcomeKind::Win => {
                self.winning_trades += 1;
                self.consecutive_wins += 1;
                self.consecutive_losses = 0;
            }
            TradeOutcomeKind::Loss => {
                self.losing_trades += 1;
                self.consecutive_losses += 1;
                self.consecutive_wins = 0;
            }
            TradeOutcomeKind::Breakeven => {}
        }

        self.total_pnl += pnl;
        let n = self.total_trades as f64;
        self.win_rate = self.winning_trades as f64 / n;
        self.avg_pnl = self.total_pnl / n;

        let delta = pnl - self.pnl_mean;
        self.pnl_mean += delta / n;
        self.pnl_m2 += delta * (pnl - self.pnl_mean);
        let std = if self.total_trades > 1 {
            (self.pnl_m2 / (n - 1.0)).max(0.0).sqrt()
        } else {
            0.0
        };
        self.sharpe_ratio = if std > f64::EPSILON { self.pnl_mean / std } else { 0.0 };

        self.peak_pnl = self.peak_pnl.max(self.total_pnl);
        self.max_drawdown = self.max_drawdown.max(self.peak_pnl - self.total_pnl);

        if self.is_testing {
            self.test_trades += 1;
            self.test_pnl += pnl;
            if outcome == TradeOutcomeKind::Win {
                self.test_wins += 1;
            }
            if self.test_trades >= testing_window {
                self.is_testing = false;
                self.test_passed = Some(self.test_win_rate() >= 0.5 && self.test_pnl > 0.0);
            }
        }

        self.updated_at = Utc::now();
        outcome
    }

    pub fn test_win_rate(&self) -> f64 {
        if self.test_trades == 0 {
            return 0.0;
        }
        self.test_wins as f64 / self.test_trades as f64
    }

    /// Probation finished and passed.
    pub fn is_trusted(&self) -> bool {
        !self.is_testing && self.test_passed == Some(true)
    }
}
