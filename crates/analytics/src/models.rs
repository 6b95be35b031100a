use analysis_core::StrategyPerformance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One order-level fact worth keeping: an entry, an exit, or a failed submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub cycle_id: String,
    pub symbol: String,
    pub strategy_id: String,
    /// "buy" or "sell"
    pub side: String,
    /// executed, would_execute, pending, broker_rejected, failed, submit_timeout, closed
    pub status: String,
    pub order_id: Option<String>,
    pub quantity: Option<f64>,
    pub notional: Option<f64>,
    pub price: Option<f64>,
    /// Realized P&L, present on closing trades only
    pub pnl: Option<f64>,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Signal,
    Hold,
    RiskRejected,
    OrderSubmitted,
    OrderFailed,
    TradeClosed,
    StrategySwitched,
    CycleError,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Signal => "signal",
            ActivityKind::Hold => "hold",
            ActivityKind::RiskRejected => "risk_rejected",
            ActivityKind::OrderSubmitted => "order_submitted",
            ActivityKind::OrderFailed => "order_failed",
            ActivityKind::TradeClosed => "trade_closed",
            ActivityKind::StrategySwitched => "strategy_switched",
            ActivityKind::CycleError => "cycle_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub cycle_id: Option<String>,
    pub kind: ActivityKind,
    pub symbol: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            cycle_id: None,
            kind,
            symbol: None,
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn for_cycle(mut self, cycle_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.cycle_id = Some(cycle_id.into());
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Flat row shape of the `strategy_performance` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StrategyPerformanceRow {
    pub strategy_id: String,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub peak_pnl: f64,
    pub pnl_mean: f64,
    pub pnl_m2: f64,
    pub consecutive_wins: i64,
    pub consecutive_losses: i64,
    pub is_testing: i64,
    pub test_trades: i64,
    pub test_wins: i64,
    pub test_pnl: f64,
    /// -1 undecided, 0 failed, 1 passed
    pub test_passed: i64,
    pub updated_at: String,
}

fn to_u32(v: i64) -> u32 {
    v.clamp(0, u32::MAX as i64) as u32
}

impl From<StrategyPerformanceRow> for StrategyPerformance {
    fn from(row: StrategyPerformanceRow) -> Self {
        StrategyPerformance {
            strategy_id: row.strategy_id,
            total_trades: to_u32(row.total_trades),
            winning_trades: to_u32(row.winning_trades),
            losing_trades: to_u32(row.losing_trades),
            total_pnl: row.total_pnl,
            win_rate: row.win_rate,
            avg_pnl: row.avg_pnl,
            sharpe_ratio: row.sharpe_ratio,
            max_drawdown: row.max_drawdown,
            peak_pnl: row.peak_pnl,
            pnl_mean: row.pnl_mean,
            pnl_m2: row.pnl_m2,
            consecutive_wins: to_u32(row.consecutive_wins),
            consecutive_losses: to_u32(row.consecutive_losses),
            is_testing: row.is_testing != 0,
            test_trades: to_u32(row.test_trades),
            test_wins: to_u32(row.test_wins),
            test_pnl: row.test_pnl,
            test_passed: match row.test_passed {
                1 => Some(true),
                0 => Some(false),
                _ => None,
            },
            updated_at: DateTime::parse_from_rfc3339(&row.updated_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}
