use std::collections::VecDeque;

use crate::orchestrator::{CycleStatus, TradeCycleResult};
use crate::positions::ClosedTrade;

const RECENT_WINDOW: usize = 20;

/// Running counters for the agent loop, logged every `log_interval_cycles`.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub holds: u64,
    pub rejections: u64,
    pub executions: u64,
    pub dry_run_executions: u64,
    pub errors: u64,
    pub trades_closed: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_pnl: f64,

    pub last_latency_ms: u64,
    pub max_latency_ms: u64,
    total_latency_ms: u64,

    recent_pnl: VecDeque<f64>,
    log_interval_cycles: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            holds: 0,
            rejections: 0,
            executions: 0,
            dry_run_executions: 0,
            errors: 0,
            trades_closed: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            last_latency_ms: 0,
            max_latency_ms: 0,
            total_latency_ms: 0,
            recent_pnl: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn record_cycle(&mut self, result: &TradeCycleResult) {
        self.cycles_run += 1;
        match result.status {
            CycleStatus::Hold => self.holds += 1,
            CycleStatus::Rejected => self.rejections += 1,
            CycleStatus::Executed if result.dry_run => self.dry_run_executions += 1,
            CycleStatus::Executed => self.executions += 1,
            CycleStatus::Error => self.errors += 1,
        }
        self.last_latency_ms = result.latency_ms;
        self.max_latency_ms = self.max_latency_ms.max(result.latency_ms);
        self.total_latency_ms += result.latency_ms;

        if self.log_interval_cycles > 0 && self.cycles_run % self.log_interval_cycles == 0 {
            self.log_metrics();
        }
    }

    pub fn record_close(&mut self, trade: &ClosedTrade) {
        self.trades_closed += 1;
        self.total_pnl += trade.pnl;
        if trade.pnl > 0.0 {
            self.winning_trades += 1;
        } else if trade.pnl < 0.0 {
            self.losing_trades += 1;
        }
        self.recent_pnl.push_back(trade.pnl);
        if self.recent_pnl.len() > RECENT_WINDOW {
            self.recent_pnl.pop_front();
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.cycles_run == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.cycles_run as f64
    }

    /// Win rate over the last 20 closed trades (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_pnl.is_empty() {
            return 0.0;
        }
        let wins = self.recent_pnl.iter().filter(|p| **p > 0.0).count() as f64;
        wins / self.recent_pnl.len() as f64 * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            cycles = self.cycles_run,
            holds = self.holds,
            rejections = self.rejections,
            executions = self.executions,
            dry_run_executions = self.dry_run_executions,
            errors = self.errors,
            trades_closed = self.trades_closed,
            total_pnl = format!("{:.2}", self.total_pnl),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            avg_latency_ms = format!("{:.0}", self.avg_latency_ms()),
            max_latency_ms = self.max_latency_ms,
            "Agent metrics summary"
        );
    }
}
