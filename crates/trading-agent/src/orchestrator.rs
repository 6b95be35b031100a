use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use analysis_core::{Signal, StrategyKind, Timeframe};
use analytics::{ActivityEvent, ActivityKind, AnalyticsRecorder, LearningEngine, TradeRecord};
use broker_trait::{AccountPort, BrokerError, MarketDataPort};
use chrono::{DateTime, Utc};
use risk_manager::{RiskAssessment, RiskEngine, Sizing, TradeProposal};
use serde::{Deserialize, Serialize};
use strategy_engine::{ExitLevels, MultiStrategyScorer};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::CycleError;
use crate::execution::{ExecutionReport, ExecutionRouter, ExecutionStatus};
use crate::positions::{OpenEntry, PositionTracker};

/// One request to run the pipeline for a symbol. Exactly one of
/// `notional_amount` and `quantity` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRequest {
    pub symbol: String,
    /// Pin the cycle to one strategy instead of the consensus pick
    pub strategy: Option<String>,
    pub notional_amount: Option<f64>,
    pub quantity: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
}

impl CycleRequest {
    pub fn notional(symbol: impl Into<String>, amount: f64) -> Self {
        Self {
            symbol: symbol.into(),
            notional_amount: Some(amount),
            ..Self::default()
        }
    }

    pub fn quantity(symbol: impl Into<String>, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Some(quantity),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy = Some(kind.id().to_string());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn sizing(&self) -> Result<Sizing, CycleError> {
        match (self.notional_amount, self.quantity) {
            (Some(n), None) => Ok(Sizing::Notional(n)),
            (None, Some(q)) => Ok(Sizing::Quantity(q)),
            (Some(_), Some(_)) => Err(CycleError::InvalidRequest(
                "set either notionalAmount or quantity, not both".to_string(),
            )),
            (None, None) => Err(CycleError::InvalidRequest(
                "one of notionalAmount or quantity is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Executed,
    Rejected,
    Hold,
    Error,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Executed => "executed",
            CycleStatus::Rejected => "rejected",
            CycleStatus::Hold => "hold",
            CycleStatus::Error => "error",
        }
    }
}

/// Outcome of one cycle.
///
/// `Executed` always carries an approved risk assessment and an order id;
/// `Rejected` always carries a rejected one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCycleResult {
    pub cycle_id: String,
    pub symbol: String,
    pub status: CycleStatus,
    pub signal: Option<Signal>,
    /// Fraction of strategies that agreed with the majority action
    pub consensus: Option<f64>,
    pub risk: Option<RiskAssessment>,
    pub order_id: Option<String>,
    pub execution: Option<ExecutionStatus>,
    pub error: Option<String>,
    pub dry_run: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub timeframe: Timeframe,
    pub bar_limit: usize,
    pub broker_timeout: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::Day1,
            bar_limit: 100,
            broker_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators a cycle runs against.
#[derive(Clone)]
pub struct CycleComponents {
    pub market: Arc<dyn MarketDataPort>,
    pub account: Arc<dyn AccountPort>,
    pub scorer: Arc<MultiStrategyScorer>,
    pub risk: Arc<RiskEngine>,
    pub router: Arc<ExecutionRouter>,
    pub recorder: Arc<AnalyticsRecorder>,
    pub learning: Arc<LearningEngine>,
    pub positions: Arc<PositionTracker>,
}

/// What is known about the cycle so far; survives into error results.
#[derive(Default)]
struct Progress {
    signal: Option<Signal>,
    consensus: Option<f64>,
    risk: Option<RiskAssessment>,
}

enum Finish {
    Hold,
    Rejected,
    Executed(ExecutionReport),
}

/// Runs the signal → risk → execution → recording pipeline for one symbol.
///
/// The pipeline is linear with two early exits (HOLD and risk rejection).
/// Nothing is retried: a failed cycle reports `status = error` and the
/// caller decides what to do next.
pub struct TradingCycleOrchestrator {
    owner: String,
    parts: CycleComponents,
    settings: CycleSettings,
    /// Highest equity peak handed to the recorder so far
    saved_peak: Mutex<f64>,
}

impl TradingCycleOrchestrator {
    pub fn new(owner: impl Into<String>, parts: CycleComponents, settings: CycleSettings) -> Self {
        let saved_peak = Mutex::new(parts.risk.peak_equity());
        Self {
            owner: owner.into(),
            parts,
            settings,
            saved_peak,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn scorer(&self) -> &Arc<MultiStrategyScorer> {
        &self.parts.scorer
    }

    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.parts.positions
    }

    pub async fn run_cycle(&self, request: CycleRequest) -> TradeCycleResult {
        let cycle_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "trading_cycle",
            owner = %self.owner,
            symbol = %request.symbol,
            cycle_id = %cycle_id
        );
        let started = Instant::now();
        let mut progress = Progress::default();

        let outcome = self
            .drive(&cycle_id, &request, &mut progress)
            .instrument(span.clone())
            .await;

        let mut result = TradeCycleResult {
            cycle_id: cycle_id.clone(),
            symbol: request.symbol.clone(),
            status: CycleStatus::Error,
            signal: progress.signal,
            consensus: progress.consensus,
            risk: progress.risk,
            order_id: None,
            execution: None,
            error: None,
            dry_run: request.dry_run,
            latency_ms: 0,
            timestamp: Utc::now(),
        };

        match outcome {
            Ok(Finish::Hold) => result.status = CycleStatus::Hold,
            Ok(Finish::Rejected) => result.status = CycleStatus::Rejected,
            Ok(Finish::Executed(report)) => {
                result.status = CycleStatus::Executed;
                result.order_id = Some(report.order_id);
                result.execution = Some(report.status);
            }
            Err(e) => {
                span.in_scope(|| tracing::error!("Cycle failed: {}", e));
                let event = ActivityEvent::new(ActivityKind::CycleError, e.to_string())
                    .for_cycle(cycle_id.clone(), request.symbol.clone());
                self.parts.recorder.log_activity(&event).await;
                result.error = Some(e.to_string());
            }
        }
        result.latency_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| {
            tracing::info!(
                status = result.status.as_str(),
                latency_ms = result.latency_ms,
                "Cycle finished"
            )
        });
        result
    }

    async fn drive(
        &self,
        cycle_id: &str,
        request: &CycleRequest,
        progress: &mut Progress,
    ) -> Result<Finish, CycleError> {
        // Idle: validate before any I/O
        let symbol = request.symbol.trim();
        if symbol.is_empty() {
            return Err(CycleError::InvalidRequest("symbol is required".to_string()));
        }
        let pinned = request
            .strategy
            .as_deref()
            .map(|s| s.parse::<StrategyKind>())
            .transpose()
            .map_err(|e| CycleError::InvalidRequest(e.to_string()))?;

        // Signaling
        let bars = self
            .bounded(
                "market data",
                self.parts
                    .market
                    .get_bars(symbol, self.settings.timeframe, self.settings.bar_limit),
            )
            .await?;
        let analysis = self.parts.scorer.analyze_all_strategies(symbol, &bars)?;
        let signal = match pinned {
            Some(kind) => self.parts.scorer.recommend_for(&analysis, kind)?,
            None => analysis.recommended_signal.clone(),
        };
        progress.consensus = Some(analysis.consensus);
        progress.signal = Some(signal.clone());

        tracing::info!(
            strategy = signal.strategy.id(),
            action = signal.action.as_str(),
            confidence = signal.confidence,
            consensus = analysis.consensus,
            "Signal: {}",
            signal.reason
        );

        if !signal.is_actionable() {
            let event = ActivityEvent::new(ActivityKind::Hold, signal.reason.clone())
                .for_cycle(cycle_id, symbol)
                .with_details(serde_json::json!({ "consensus": analysis.consensus }));
            self.parts.recorder.log_activity(&event).await;
            return Ok(Finish::Hold);
        }

        let event = ActivityEvent::new(
            ActivityKind::Signal,
            format!("{} {} ({:.2})", signal.action, symbol, signal.confidence),
        )
        .for_cycle(cycle_id, symbol)
        .with_details(serde_json::json!({
            "strategy": signal.strategy.id(),
            "consensus": analysis.consensus,
            "indicators": signal.indicators,
        }));
        self.parts.recorder.log_activity(&event).await;

        // RiskChecking
        let mut sizing = request.sizing()?;
        let factor = self.parts.learning.size_factor(signal.strategy.id());
        if factor < 1.0 {
            tracing::info!(
                "{} is on probation, sizing scaled by {:.2}",
                signal.strategy.id(),
                factor
            );
            sizing = sizing.scaled(factor);
        }

        let account = self.bounded("account", self.parts.account.get_account()).await?;
        let positions = self
            .bounded("positions", self.parts.account.get_positions())
            .await?;
        let proposal = TradeProposal::entry(signal.clone(), sizing);
        let risk = self
            .parts
            .risk
            .assess_trade_risk(&proposal, &account, &positions);
        progress.risk = Some(risk.clone());
        self.save_peak_equity().await;

        if !risk.approved {
            tracing::info!(risk_score = risk.risk_score, "Risk rejected: {}", risk.reasons.join("; "));
            let event = ActivityEvent::new(ActivityKind::RiskRejected, risk.reasons.join("; "))
                .for_cycle(cycle_id, symbol)
                .with_details(serde_json::json!({ "risk_score": risk.risk_score }));
            self.parts.recorder.log_activity(&event).await;
            return Ok(Finish::Rejected);
        }

        // Executing + Recording. Once the order is sent the rest must finish
        // even if the caller goes away, so it runs as its own task.
        let submission = Submission {
            router: self.parts.router.clone(),
            recorder: self.parts.recorder.clone(),
            positions: self.parts.positions.clone(),
            cycle_id: cycle_id.to_string(),
            signal,
            sizing: risk.sizing,
            dry_run: request.dry_run,
        };
        let report = tokio::spawn(submission.run().in_current_span())
            .await
            .map_err(|e| CycleError::Internal(e.to_string()))??;
        Ok(Finish::Executed(report))
    }

    /// Persist the drawdown peak when the risk engine has seen a new high,
    /// so a restart does not re-arm the breaker from a lower equity.
    async fn save_peak_equity(&self) {
        let peak = self.parts.risk.peak_equity();
        {
            let mut saved = self.saved_peak.lock().unwrap_or_else(|e| e.into_inner());
            if peak <= *saved {
                return;
            }
            *saved = peak;
        }
        tracing::debug!("New equity peak ${:.2}", peak);
        self.parts.recorder.save_peak_equity(peak).await;
    }

    async fn bounded<T>(
        &self,
        stage: &'static str,
        fut: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, CycleError> {
        let limit = self.settings.broker_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(CycleError::from),
            Err(_) => Err(CycleError::Timeout {
                stage,
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }
}

struct Submission {
    router: Arc<ExecutionRouter>,
    recorder: Arc<AnalyticsRecorder>,
    positions: Arc<PositionTracker>,
    cycle_id: String,
    signal: Signal,
    sizing: Sizing,
    dry_run: bool,
}

impl Submission {
    async fn run(self) -> Result<ExecutionReport, CycleError> {
        let symbol = self.signal.symbol.clone();
        let outcome = self
            .router
            .execute(&self.signal, self.sizing, self.dry_run)
            .await;

        let report = match outcome {
            Ok(report) if report.status != ExecutionStatus::Rejected => report,
            Ok(report) => {
                let err = CycleError::Broker(BrokerError::Rejected(format!(
                    "order {} for {} was rejected",
                    report.order_id, symbol
                )));
                self.record(Some(&report), "broker_rejected").await;
                self.log_failure(&err).await;
                return Err(err);
            }
            Err(err) => {
                // a submit that timed out may still have reached the broker
                let status = match &err {
                    CycleError::Timeout { .. } | CycleError::Broker(BrokerError::Timeout(_)) => {
                        "submit_timeout"
                    }
                    _ => "failed",
                };
                self.record(None, status).await;
                self.log_failure(&err).await;
                return Err(err);
            }
        };

        let status = match report.status {
            ExecutionStatus::WouldExecute => "would_execute",
            ExecutionStatus::Pending => "pending",
            _ => "executed",
        };
        self.record(Some(&report), status).await;
        let event = ActivityEvent::new(
            ActivityKind::OrderSubmitted,
            format!(
                "{} {} order {} ({})",
                report.request.side.as_str(),
                symbol,
                report.order_id,
                report.status.as_str()
            ),
        )
        .for_cycle(self.cycle_id.clone(), symbol.clone())
        .with_details(serde_json::json!({
            "strategy": self.signal.strategy.id(),
            "dry_run": self.dry_run,
            "sizing": self.sizing,
        }));
        self.recorder.log_activity(&event).await;

        if !self.dry_run {
            self.positions.track(self.open_entry(&report));
        }
        Ok(report)
    }

    fn open_entry(&self, report: &ExecutionReport) -> OpenEntry {
        let entry_price = report
            .filled_avg_price
            .filter(|p| *p > 0.0)
            .unwrap_or(self.signal.entry_price);
        let quantity = report.filled_qty.filter(|q| *q > 0.0).unwrap_or(match self.sizing {
            Sizing::Quantity(q) => q,
            Sizing::Notional(n) => n / self.signal.entry_price,
        });
        let levels = ExitLevels {
            side: self.signal.action,
            entry_price,
            stop_loss: self.signal.stop_loss,
            take_profit: self.signal.take_profit,
        };
        OpenEntry {
            cycle_id: self.cycle_id.clone(),
            symbol: self.signal.symbol.clone(),
            strategy: self.signal.strategy,
            side: report.request.side,
            quantity,
            levels,
            order_id: report.order_id.clone(),
            opened_at: Utc::now(),
        }
    }

    async fn record(&self, report: Option<&ExecutionReport>, status: &str) {
        let (quantity, notional) = match self.sizing {
            Sizing::Quantity(q) => (Some(q), None),
            Sizing::Notional(n) => (None, Some(n)),
        };
        let record = TradeRecord {
            cycle_id: self.cycle_id.clone(),
            symbol: self.signal.symbol.clone(),
            strategy_id: self.signal.strategy.id().to_string(),
            side: self.signal.action.as_str().to_ascii_lowercase(),
            status: status.to_string(),
            order_id: report.map(|r| r.order_id.clone()),
            quantity: report.and_then(|r| r.filled_qty).or(quantity),
            notional,
            price: report
                .and_then(|r| r.filled_avg_price)
                .or(Some(self.signal.entry_price)),
            pnl: None,
            dry_run: self.dry_run,
            timestamp: Utc::now(),
        };
        self.recorder.record_trade(&record).await;
    }

    async fn log_failure(&self, err: &CycleError) {
        let event = ActivityEvent::new(ActivityKind::OrderFailed, err.to_string())
            .for_cycle(self.cycle_id.clone(), self.signal.symbol.clone());
        self.recorder.log_activity(&event).await;
    }
}
