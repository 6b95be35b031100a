use std::sync::Arc;

use analysis_core::{StrategyKind, StrategyPerformance};
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strategy_engine::PerformanceSource;
use tokio::sync::Mutex;

use crate::recorder::AnalyticsRecorder;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Trades a new strategy spends on probation
    pub testing_window: u32,
    /// Size multiplier for strategies that are not yet trusted
    pub probation_size_factor: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            testing_window: 7,
            probation_size_factor: 0.5,
        }
    }
}

/// Folds closed-trade outcomes into per-strategy statistics.
///
/// Updates for one strategy are serialized through a per-key async mutex;
/// different strategies proceed in parallel. Readers (the scorer) see the
/// last committed snapshot and never wait on a writer.
///
/// An outcome whose base statistics cannot be loaded is deferred, in arrival
/// order, and applied by the next successful update or `replay_deferred`.
pub struct LearningEngine {
    recorder: Arc<AnalyticsRecorder>,
    config: LearningConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    committed: DashMap<String, StrategyPerformance>,
    deferred: DashMap<String, Vec<f64>>,
}

impl LearningEngine {
    pub fn new(recorder: Arc<AnalyticsRecorder>, config: LearningConfig) -> Self {
        Self {
            recorder,
            config,
            locks: DashMap::new(),
            committed: DashMap::new(),
            deferred: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Load persisted statistics for `strategy_ids` into the snapshot cache.
    /// Returns how many had a stored row.
    pub async fn warm<'a>(&self, strategy_ids: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let mut loaded = 0;
        for id in strategy_ids {
            if let Some(perf) = self
                .recorder
                .load_performance(id)
                .await
                .with_context(|| format!("warming statistics for {}", id))?
            {
                tracing::info!(
                    "Loaded {} history: {} trades, win rate {:.1}%",
                    id,
                    perf.total_trades,
                    perf.win_rate * 100.0
                );
                self.committed.insert(id.to_string(), perf);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Record one closed trade for `strategy_id` and return the updated
    /// statistics. The snapshot is committed in memory before the write, so
    /// a failed write is retried out-of-band without losing the outcome.
    pub async fn record_outcome(&self, strategy_id: &str, pnl: f64) -> Result<StrategyPerformance> {
        let lock = self.key_lock(strategy_id);
        let _guard = lock.lock().await;

        let mut perf = match self.base(strategy_id).await {
            Ok(perf) => perf,
            Err(e) => {
                self.deferred.entry(strategy_id.to_string()).or_default().push(pnl);
                tracing::warn!(
                    "Outcome for {} (P&L ${:.2}) deferred until statistics load: {:#}",
                    strategy_id,
                    pnl,
                    e
                );
                return Err(e.context(format!("outcome for {} deferred", strategy_id)));
            }
        };

        let was_testing = perf.is_testing;
        self.apply_deferred(strategy_id, &mut perf);
        let outcome = perf.apply_trade(pnl, self.config.testing_window);
        self.committed.insert(strategy_id.to_string(), perf.clone());

        tracing::info!(
            strategy = strategy_id,
            outcome = outcome.as_str(),
            pnl,
            total_trades = perf.total_trades,
            win_rate = perf.win_rate,
            "Recorded trade outcome"
        );
        if was_testing && !perf.is_testing {
            tracing::info!(
                "{} finished probation: {} ({}/{} wins, P&L ${:.2})",
                strategy_id,
                if perf.test_passed == Some(true) { "passed" } else { "failed" },
                perf.test_wins,
                perf.test_trades,
                perf.test_pnl
            );
        }

        self.recorder.save_performance(&perf).await;
        Ok(perf)
    }

    /// Apply deferred outcomes for every strategy whose statistics now
    /// load. Returns how many outcomes were applied.
    pub async fn replay_deferred(&self) -> usize {
        let ids: Vec<String> = self.deferred.iter().map(|e| e.key().clone()).collect();
        let mut applied = 0;
        for id in ids {
            let lock = self.key_lock(&id);
            let _guard = lock.lock().await;

            let mut perf = match self.base(&id).await {
                Ok(perf) => perf,
                Err(e) => {
                    tracing::warn!("Deferred outcomes for {} still waiting: {:#}", id, e);
                    continue;
                }
            };
            let n = self.apply_deferred(&id, &mut perf);
            if n == 0 {
                continue;
            }
            tracing::info!(
                "Replayed {} deferred outcome(s) for {} ({} trades)",
                n,
                id,
                perf.total_trades
            );
            self.committed.insert(id.clone(), perf.clone());
            self.recorder.save_performance(&perf).await;
            applied += n;
        }
        applied
    }

    /// Outcomes waiting for their strategy's statistics to load.
    pub fn deferred_len(&self) -> usize {
        self.deferred.iter().map(|e| e.value().len()).sum()
    }

    fn key_lock(&self, strategy_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(strategy_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Committed snapshot, else the stored one, else fresh statistics.
    /// Caller holds the strategy's lock.
    async fn base(&self, strategy_id: &str) -> Result<StrategyPerformance> {
        if let Some(perf) = self.committed.get(strategy_id).map(|p| p.clone()) {
            return Ok(perf);
        }
        Ok(self
            .recorder
            .load_performance(strategy_id)
            .await
            .with_context(|| format!("loading statistics for {}", strategy_id))?
            .unwrap_or_else(|| StrategyPerformance::new(strategy_id)))
    }

    fn apply_deferred(&self, strategy_id: &str, perf: &mut StrategyPerformance) -> usize {
        let Some((_, pending)) = self.deferred.remove(strategy_id) else {
            return 0;
        };
        for pnl in &pending {
            perf.apply_trade(*pnl, self.config.testing_window);
        }
        pending.len()
    }

    /// Last committed statistics for `strategy_id`.
    pub fn committed(&self, strategy_id: &str) -> Option<StrategyPerformance> {
        self.committed.get(strategy_id).map(|p| p.clone())
    }

    /// Multiplier applied to entry sizes: 1.0 once a strategy has passed
    /// probation, the probation factor otherwise (including no history).
    pub fn size_factor(&self, strategy_id: &str) -> f64 {
        let trusted = self
            .committed
            .get(strategy_id)
            .map(|p| p.is_trusted())
            .unwrap_or(false);
        if trusted {
            1.0
        } else {
            self.config.probation_size_factor.clamp(0.0, 1.0)
        }
    }
}

impl PerformanceSource for LearningEngine {
    fn snapshot(&self, kind: StrategyKind) -> Option<StrategyPerformance> {
        self.committed(kind.id())
    }
}
