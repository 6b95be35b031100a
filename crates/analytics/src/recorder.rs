use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_core::StrategyPerformance;
use anyhow::{anyhow, Result};

use crate::models::{ActivityEvent, TradeRecord};
use crate::persistence::PersistencePort;

const DEFAULT_MAX_PENDING: usize = 1_000;

/// A write that failed and waits for `flush_pending`.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Trade(TradeRecord),
    Performance(StrategyPerformance),
    Activity(ActivityEvent),
    PeakEquity(f64),
}

impl PendingWrite {
    fn label(&self) -> &'static str {
        match self {
            PendingWrite::Trade(_) => "trade",
            PendingWrite::Performance(_) => "performance",
            PendingWrite::Activity(_) => "activity",
            PendingWrite::PeakEquity(_) => "peak equity",
        }
    }
}

/// Best-effort writer in front of a `PersistencePort`.
///
/// Writes never return an error to the caller. A failed or timed-out write is
/// logged and queued; `flush_pending` retries the queue in order. Only the
/// latest snapshot per strategy, and the latest equity peak, is kept in the
/// queue.
pub struct AnalyticsRecorder {
    store: Arc<dyn PersistencePort>,
    timeout: Duration,
    pending: Mutex<VecDeque<PendingWrite>>,
    max_pending: usize,
}

impl AnalyticsRecorder {
    pub fn new(store: Arc<dyn PersistencePort>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            pending: Mutex::new(VecDeque::new()),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn PersistencePort> {
        &self.store
    }

    /// Blocking read of the persisted snapshot, bounded by the write timeout.
    pub async fn load_performance(&self, strategy_id: &str) -> Result<Option<StrategyPerformance>> {
        bounded(self.timeout, self.store.load_strategy_performance(strategy_id)).await
    }

    pub async fn load_peak_equity(&self) -> Result<Option<f64>> {
        bounded(self.timeout, self.store.load_peak_equity()).await
    }

    pub async fn save_peak_equity(&self, peak: f64) -> bool {
        self.attempt(PendingWrite::PeakEquity(peak)).await
    }

    pub async fn record_trade(&self, record: &TradeRecord) -> bool {
        let write = PendingWrite::Trade(record.clone());
        self.attempt(write).await
    }

    pub async fn save_performance(&self, perf: &StrategyPerformance) -> bool {
        let write = PendingWrite::Performance(perf.clone());
        self.attempt(write).await
    }

    pub async fn log_activity(&self, event: &ActivityEvent) -> bool {
        let write = PendingWrite::Activity(event.clone());
        self.attempt(write).await
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Retry every queued write once. Returns how many succeeded; failures
    /// go back on the queue in their original order.
    pub async fn flush_pending(&self) -> usize {
        let batch: Vec<PendingWrite> = self.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }

        let total = batch.len();
        let mut flushed = 0;
        let mut failed = Vec::new();
        for write in batch {
            match self.write(&write).await {
                Ok(()) => flushed += 1,
                Err(_) => failed.push(write),
            }
        }

        if !failed.is_empty() {
            let mut queue = self.lock();
            // anything queued while flushing is newer; keep it behind the retries
            let newer: Vec<PendingWrite> = queue.drain(..).collect();
            for write in failed.into_iter().chain(newer) {
                self.enqueue_locked(&mut queue, write);
            }
        }

        tracing::info!("Flushed {}/{} pending analytics writes", flushed, total);
        flushed
    }

    async fn attempt(&self, write: PendingWrite) -> bool {
        match self.write(&write).await {
            Ok(()) => {
                // the stored row is now newer than anything queued for it
                self.lock().retain(|w| !supersedes(&write, w));
                true
            }
            Err(e) => {
                tracing::warn!("Analytics {} write failed, queued for retry: {:#}", write.label(), e);
                let mut queue = self.lock();
                self.enqueue_locked(&mut queue, write);
                false
            }
        }
    }

    async fn write(&self, write: &PendingWrite) -> Result<()> {
        match write {
            PendingWrite::Trade(r) => bounded(self.timeout, self.store.save_trade(r)).await,
            PendingWrite::Performance(p) => {
                bounded(self.timeout, self.store.save_strategy_performance(p)).await
            }
            PendingWrite::Activity(e) => bounded(self.timeout, self.store.log_activity(e)).await,
            PendingWrite::PeakEquity(peak) => {
                bounded(self.timeout, self.store.save_peak_equity(*peak)).await
            }
        }
    }

    fn enqueue_locked(&self, queue: &mut VecDeque<PendingWrite>, write: PendingWrite) {
        queue.retain(|w| !supersedes(&write, w));
        if queue.len() >= self.max_pending {
            if let Some(dropped) = queue.pop_front() {
                tracing::error!(
                    "Analytics retry queue full ({}), dropping oldest {} write",
                    self.max_pending,
                    dropped.label()
                );
            }
        }
        queue.push_back(write);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingWrite>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether `newer` makes the queued write `older` redundant.
fn supersedes(newer: &PendingWrite, older: &PendingWrite) -> bool {
    match (newer, older) {
        (PendingWrite::Performance(a), PendingWrite::Performance(b)) => {
            a.strategy_id == b.strategy_id
        }
        (PendingWrite::PeakEquity(a), PendingWrite::PeakEquity(b)) => a >= b,
        _ => false,
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("persistence call timed out after {}ms", limit.as_millis()))?
}
