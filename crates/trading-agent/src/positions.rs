use std::sync::Arc;
use std::time::Duration;

use analysis_core::{Bar, StrategyKind, StrategyPerformance, Timeframe};
use analytics::{ActivityEvent, ActivityKind, AnalyticsRecorder, LearningEngine, TradeRecord};
use broker_trait::{MarketDataPort, OrderSide};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strategy_engine::{classify_exit, realized_pnl, ExitDecision, ExitLevels, MultiStrategyScorer};

use crate::error::CycleError;
use crate::execution::{ExecutionRouter, ExecutionStatus};

/// Below this a tracked quantity counts as flat.
const QUANTITY_EPSILON: f64 = 1e-9;

/// A position this agent opened and still watches for its exit levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenEntry {
    pub cycle_id: String,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub side: OrderSide,
    pub quantity: f64,
    pub levels: ExitLevels,
    pub order_id: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub entry: OpenEntry,
    pub exit: ExitDecision,
    pub exit_price: f64,
    pub close_order_id: String,
    pub pnl: f64,
    /// Updated statistics, absent when the learning update failed
    pub performance: Option<StrategyPerformance>,
}

/// Tracks executed entries per symbol and closes them when a stop or target
/// is hit, feeding the realized P&L back into the learning engine.
pub struct PositionTracker {
    entries: DashMap<String, OpenEntry>,
    market: Arc<dyn MarketDataPort>,
    router: Arc<ExecutionRouter>,
    recorder: Arc<AnalyticsRecorder>,
    learning: Arc<LearningEngine>,
    scorer: Arc<MultiStrategyScorer>,
    timeframe: Timeframe,
    timeout: Duration,
}

impl PositionTracker {
    pub fn new(
        market: Arc<dyn MarketDataPort>,
        router: Arc<ExecutionRouter>,
        recorder: Arc<AnalyticsRecorder>,
        learning: Arc<LearningEngine>,
        scorer: Arc<MultiStrategyScorer>,
        timeframe: Timeframe,
        timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            market,
            router,
            recorder,
            learning,
            scorer,
            timeframe,
            timeout,
        }
    }

    /// Start watching an entry. A same-side entry on a watched symbol is
    /// merged at the average price; an opposite-side one replaces it.
    pub fn track(&self, entry: OpenEntry) {
        match self.entries.entry(entry.symbol.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.side == entry.side {
                    let total = existing.quantity + entry.quantity;
                    if total > 0.0 {
                        existing.levels.entry_price = (existing.levels.entry_price
                            * existing.quantity
                            + entry.levels.entry_price * entry.quantity)
                            / total;
                    }
                    existing.quantity = total;
                    existing.levels.stop_loss = entry.levels.stop_loss;
                    existing.levels.take_profit = entry.levels.take_profit;
                    tracing::info!(
                        "Added {:.6} to tracked {} entry (now {:.6})",
                        entry.quantity,
                        entry.symbol,
                        total
                    );
                } else {
                    tracing::warn!(
                        "{} entry {} replaces opposite-side tracked entry {}",
                        entry.symbol,
                        entry.order_id,
                        existing.order_id
                    );
                    *existing = entry;
                }
            }
            Entry::Vacant(slot) => {
                tracing::info!(
                    "Tracking {} {} x{:.6} (stop {:?}, target {:?})",
                    entry.side.as_str(),
                    entry.symbol,
                    entry.quantity,
                    entry.levels.stop_loss,
                    entry.levels.take_profit
                );
                slot.insert(entry);
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<OpenEntry> {
        self.entries.get(symbol).map(|e| e.clone())
    }

    pub fn open_entries(&self) -> Vec<OpenEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every tracked entry against its latest bar and close the ones
    /// whose stop or target was touched. Failures leave the entry tracked
    /// for the next pass.
    pub async fn monitor_open_entries(&self) -> Vec<ClosedTrade> {
        let mut closed = Vec::new();
        for entry in self.open_entries() {
            let bar = match self.latest_bar(&entry).await {
                Ok(Some(bar)) => bar,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Exit check for {} skipped: {}", entry.symbol, e);
                    continue;
                }
            };
            let Some(exit) = classify_exit(&entry.levels, &bar) else {
                continue;
            };
            match self.close(entry, exit).await {
                Ok(trade) => closed.push(trade),
                Err(e) => tracing::error!("Failed to close tracked entry: {}", e),
            }
        }

        if !closed.is_empty() {
            if let Some(switch) = self.scorer.evaluate_auto_switch() {
                let event = ActivityEvent::new(
                    ActivityKind::StrategySwitched,
                    format!("active strategy {} -> {}", switch.from, switch.to),
                )
                .with_details(serde_json::json!({
                    "from_score": switch.from_score,
                    "to_score": switch.to_score,
                }));
                self.recorder.log_activity(&event).await;
            }
        }
        closed
    }

    /// Stop watching the quantity that was just closed. Same-side additions
    /// keep the entry's order id, so the live quantity may exceed the snapshot.
    fn release(&self, closed: &OpenEntry) {
        if let Entry::Occupied(mut slot) = self.entries.entry(closed.symbol.clone()) {
            if slot.get().order_id != closed.order_id {
                return;
            }
            let remaining = slot.get().quantity - closed.quantity;
            if remaining > QUANTITY_EPSILON {
                tracing::info!(
                    "{} still tracks {:.6} added while closing",
                    closed.symbol,
                    remaining
                );
                slot.get_mut().quantity = remaining;
            } else {
                slot.remove();
            }
        }
    }

    /// Most recent bar that could include prices after the entry.
    async fn latest_bar(&self, entry: &OpenEntry) -> Result<Option<Bar>, CycleError> {
        let bars = tokio::time::timeout(
            self.timeout,
            self.market.get_bars(&entry.symbol, self.timeframe, 1),
        )
        .await
        .map_err(|_| CycleError::Timeout {
            stage: "exit bars",
            timeout_ms: self.timeout.as_millis() as u64,
        })??;

        let span = chrono::Duration::minutes(self.timeframe.to_minutes());
        Ok(bars
            .into_iter()
            .last()
            .filter(|bar| bar.timestamp + span > entry.opened_at))
    }

    /// Close the quantity in `entry`, a snapshot of the tracked entry. Any
    /// quantity merged in after the snapshot stays tracked.
    pub(crate) async fn close(
        &self,
        entry: OpenEntry,
        exit: ExitDecision,
    ) -> Result<ClosedTrade, CycleError> {
        let report = self
            .router
            .close_entry(&entry.symbol, entry.side, entry.quantity, false)
            .await?;
        if report.status == ExecutionStatus::Rejected {
            return Err(CycleError::Broker(broker_trait::BrokerError::Rejected(format!(
                "close order {} for {} was rejected",
                report.order_id, entry.symbol
            ))));
        }

        self.release(&entry);

        let exit_price = report.filled_avg_price.unwrap_or(exit.price);
        let pnl = realized_pnl(entry.levels.side, entry.levels.entry_price, exit_price, entry.quantity);
        tracing::info!(
            symbol = %entry.symbol,
            strategy = entry.strategy.id(),
            reason = exit.reason.as_str(),
            pnl,
            "Closed {} entry at ${:.2}",
            entry.side.as_str(),
            exit_price
        );

        let record = TradeRecord {
            cycle_id: entry.cycle_id.clone(),
            symbol: entry.symbol.clone(),
            strategy_id: entry.strategy.id().to_string(),
            side: report.request.side.as_str().to_string(),
            status: "closed".to_string(),
            order_id: Some(report.order_id.clone()),
            quantity: Some(entry.quantity),
            notional: Some(entry.quantity * exit_price),
            price: Some(exit_price),
            pnl: Some(pnl),
            dry_run: false,
            timestamp: Utc::now(),
        };
        self.recorder.record_trade(&record).await;
        let event = ActivityEvent::new(
            ActivityKind::TradeClosed,
            format!("{} {} at ${:.2}, P&L ${:.2}", exit.reason.as_str(), entry.symbol, exit_price, pnl),
        )
        .for_cycle(entry.cycle_id.clone(), entry.symbol.clone());
        self.recorder.log_activity(&event).await;

        let performance = match self.learning.record_outcome(entry.strategy.id(), pnl).await {
            Ok(perf) => Some(perf),
            Err(e) => {
                tracing::warn!("Learning update for {} failed: {:#}", entry.strategy.id(), e);
                None
            }
        };

        Ok(ClosedTrade {
            entry,
            exit,
            exit_price,
            close_order_id: report.order_id,
            pnl,
            performance,
        })
    }
}
