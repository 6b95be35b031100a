use analysis_core::{Bar, Signal, SignalAction};
use serde::{Deserialize, Serialize};

/// Protective levels of one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub side: SignalAction,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl ExitLevels {
    /// `None` for HOLD signals, which never open a position.
    pub fn from_signal(signal: &Signal) -> Option<Self> {
        if !signal.is_actionable() {
            return None;
        }
        Some(Self {
            side: signal.action,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Holding period ran out without either level being touched
    Horizon,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Horizon => "horizon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub price: f64,
}

/// Decide whether `bar` closes the position, and at what price.
///
/// Used by both live monitoring and the backtest so that win rates from
/// either path are comparable. When a bar touches both levels the stop is
/// assumed to fill first. A bar that opens beyond a level fills at the open.
pub fn classify_exit(levels: &ExitLevels, bar: &Bar) -> Option<ExitDecision> {
    match levels.side {
        SignalAction::Buy => {
            if let Some(stop) = levels.stop_loss {
                if bar.low <= stop {
                    return Some(ExitDecision {
                        reason: ExitReason::StopLoss,
                        price: bar.open.min(stop),
                    });
                }
            }
            if let Some(target) = levels.take_profit {
                if bar.high >= target {
                    return Some(ExitDecision {
                        reason: ExitReason::TakeProfit,
                        price: bar.open.max(target),
                    });
                }
            }
            None
        }
        SignalAction::Sell => {
            if let Some(stop) = levels.stop_loss {
                if bar.high >= stop {
                    return Some(ExitDecision {
                        reason: ExitReason::StopLoss,
                        price: bar.open.max(stop),
                    });
                }
            }
            if let Some(target) = levels.take_profit {
                if bar.low <= target {
                    return Some(ExitDecision {
                        reason: ExitReason::TakeProfit,
                        price: bar.open.min(target),
                    });
                }
            }
            None
        }
        SignalAction::Hold => None,
    }
}

/// Signed P&L of closing `quantity` units.
pub fn realized_pnl(side: SignalAction, entry_price: f64, exit_price: f64, quantity: f64) -> f64 {
    (exit_price - entry_price) * quantity * side.direction()
}
