#[cfg(test)]
mod cycle_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use analysis_core::{Bar, SignalAction, StrategyKind, StrategyPerformance, Timeframe};
    use analytics::{
        ActivityEvent, AnalyticsRecorder, LearningConfig, LearningEngine, PersistencePort,
        TradeRecord,
    };
    use anyhow::anyhow;
    use async_trait::async_trait;
    use broker_trait::{
        AccountPort, AccountSnapshot, BrokerError, MarketDataPort, OrderAck, OrderAmount,
        OrderPort, OrderRequest, OrderSide, OrderStatus, PositionSnapshot,
    };
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use risk_manager::{RiskEngine, RiskParameters};
    use rust_decimal_macros::dec;
    use strategy_engine::{ExitDecision, ExitReason, MultiStrategyScorer, ScorerConfig};

    use crate::execution::{ExecutionRouter, ExecutionStatus};
    use crate::orchestrator::*;
    use crate::positions::{OpenEntry, PositionTracker};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    struct FakeBroker {
        bars: Mutex<Result<Vec<Bar>, BrokerError>>,
        bars_delay: Duration,
        submit_delay: Duration,
        account: AccountSnapshot,
        positions: Vec<PositionSnapshot>,
        fill: OrderStatus,
        submit_error: Option<BrokerError>,
        bar_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        submitted: Mutex<Vec<OrderRequest>>,
    }

    impl FakeBroker {
        fn new(bars: Vec<Bar>) -> Self {
            Self {
                bars: Mutex::new(Ok(bars)),
                bars_delay: Duration::ZERO,
                submit_delay: Duration::ZERO,
                account: AccountSnapshot {
                    equity: 10_000.0,
                    cash: 10_000.0,
                    buying_power: 20_000.0,
                    last_equity: 10_000.0,
                },
                positions: Vec::new(),
                fill: OrderStatus::Pending,
                submit_error: None,
                bar_calls: AtomicUsize::new(0),
                submit_calls: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn submits(&self) -> usize {
            self.submit_calls.load(Ordering::SeqCst)
        }

        fn set_bars(&self, bars: Vec<Bar>) {
            *self.bars.lock().unwrap() = Ok(bars);
        }
    }

    #[async_trait]
    impl MarketDataPort for FakeBroker {
        async fn get_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Bar>, BrokerError> {
            self.bar_calls.fetch_add(1, Ordering::SeqCst);
            if !self.bars_delay.is_zero() {
                tokio::time::sleep(self.bars_delay).await;
            }
            let bars = self.bars.lock().unwrap().clone()?;
            let skip = bars.len().saturating_sub(limit);
            Ok(bars[skip..].to_vec())
        }
    }

    #[async_trait]
    impl AccountPort for FakeBroker {
        async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
            Ok(self.account.clone())
        }

        async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
            Ok(self.positions.clone())
        }
    }

    #[async_trait]
    impl OrderPort for FakeBroker {
        async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
            let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.submitted.lock().unwrap().push(order.clone());
            if !self.submit_delay.is_zero() {
                tokio::time::sleep(self.submit_delay).await;
            }
            if let Some(err) = &self.submit_error {
                return Err(err.clone());
            }
            Ok(OrderAck {
                order_id: format!("order-{}", n),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                status: self.fill,
                filled_qty: None,
                filled_avg_price: None,
                submitted_at: Utc::now(),
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
            Err(BrokerError::Transport(format!("unknown order {}", order_id)))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        failing: AtomicBool,
        trades: Mutex<Vec<TradeRecord>>,
        activities: Mutex<Vec<ActivityEvent>>,
        peaks: Mutex<Vec<f64>>,
    }

    impl FakeStore {
        fn check(&self) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(anyhow!("disk I/O error"))
            } else {
                Ok(())
            }
        }

        fn trade_statuses(&self) -> Vec<String> {
            self.trades.lock().unwrap().iter().map(|t| t.status.clone()).collect()
        }
    }

    #[async_trait]
    impl PersistencePort for FakeStore {
        async fn save_trade(&self, record: &TradeRecord) -> anyhow::Result<()> {
            self.check()?;
            self.trades.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn save_strategy_performance(&self, _perf: &StrategyPerformance) -> anyhow::Result<()> {
            self.check()
        }

        async fn load_strategy_performance(
            &self,
            _strategy_id: &str,
        ) -> anyhow::Result<Option<StrategyPerformance>> {
            Ok(None)
        }

        async fn log_activity(&self, event: &ActivityEvent) -> anyhow::Result<()> {
            self.check()?;
            self.activities.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn save_peak_equity(&self, peak: f64) -> anyhow::Result<()> {
            self.check()?;
            self.peaks.lock().unwrap().push(peak);
            Ok(())
        }

        async fn load_peak_equity(&self) -> anyhow::Result<Option<f64>> {
            Ok(self.peaks.lock().unwrap().iter().copied().reduce(f64::max))
        }
    }

    struct Harness {
        broker: Arc<FakeBroker>,
        store: Arc<FakeStore>,
        recorder: Arc<AnalyticsRecorder>,
        learning: Arc<LearningEngine>,
        positions: Arc<PositionTracker>,
        orchestrator: TradingCycleOrchestrator,
    }

    fn harness(broker: FakeBroker) -> Harness {
        harness_with(
            broker,
            Arc::new(FakeStore::default()),
            RiskEngine::new(RiskParameters::default()),
        )
    }

    fn harness_with(broker: FakeBroker, store: Arc<FakeStore>, risk: RiskEngine) -> Harness {
        let broker = Arc::new(broker);
        let timeout = Duration::from_millis(200);

        let recorder = Arc::new(AnalyticsRecorder::new(store.clone(), timeout));
        let learning = Arc::new(LearningEngine::new(recorder.clone(), LearningConfig::default()));
        let scorer = Arc::new(MultiStrategyScorer::new(ScorerConfig::default(), learning.clone()));
        let router = Arc::new(ExecutionRouter::new(broker.clone(), timeout));
        let positions = Arc::new(PositionTracker::new(
            broker.clone(),
            router.clone(),
            recorder.clone(),
            learning.clone(),
            scorer.clone(),
            Timeframe::Day1,
            timeout,
        ));
        let orchestrator = TradingCycleOrchestrator::new(
            "test-owner",
            CycleComponents {
                market: broker.clone(),
                account: broker.clone(),
                scorer,
                risk: Arc::new(risk),
                router,
                recorder: recorder.clone(),
                learning: learning.clone(),
                positions: positions.clone(),
            },
            CycleSettings {
                timeframe: Timeframe::Day1,
                bar_limit: 100,
                broker_timeout: timeout,
            },
        );

        Harness {
            broker,
            store,
            recorder,
            learning,
            positions,
            orchestrator,
        }
    }

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let mut prev = closes.first().copied().unwrap_or(100.0);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = prev;
                prev = close;
                Bar {
                    timestamp: start + ChronoDuration::days(i as i64),
                    open,
                    high: open.max(close) + 0.5,
                    low: open.min(close) - 0.5,
                    close,
                    volume: 1_000_000.0,
                    vwap: None,
                }
            })
            .collect()
    }

    /// 100 strictly rising closes, 100..=199
    fn uptrend() -> Vec<Bar> {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + i as f64).collect();
        bars_from_closes(&closes)
    }

    fn momentum_buy(notional: f64) -> CycleRequest {
        CycleRequest::notional("AAPL", notional).with_strategy(StrategyKind::Momentum)
    }

    fn assert_invariants(result: &TradeCycleResult) {
        match result.status {
            CycleStatus::Executed => {
                assert!(result.risk.as_ref().unwrap().approved);
                assert!(!result.order_id.as_deref().unwrap_or("").is_empty());
            }
            CycleStatus::Rejected => {
                assert!(!result.risk.as_ref().unwrap().approved);
                assert!(result.order_id.is_none());
            }
            CycleStatus::Hold => {
                assert_eq!(result.signal.as_ref().unwrap().action, SignalAction::Hold);
                assert!(result.order_id.is_none());
            }
            CycleStatus::Error => assert!(result.error.is_some()),
        }
    }

    // -----------------------------------------------------------------------
    // Cycle outcomes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_dry_run_never_submits() {
        let h = harness(FakeBroker::new(uptrend()));
        let result = h.orchestrator.run_cycle(momentum_buy(500.0).dry_run(true)).await;

        assert_eq!(result.status, CycleStatus::Executed);
        assert_eq!(result.execution, Some(ExecutionStatus::WouldExecute));
        assert!(result.order_id.as_deref().unwrap().starts_with("dry-run-"));
        assert!(result.dry_run);
        assert_eq!(h.broker.submits(), 0);
        assert!(h.positions.is_empty());
        assert_eq!(h.store.trade_statuses(), vec!["would_execute"]);
        assert_invariants(&result);
    }

    #[tokio::test]
    async fn test_live_cycle_submits_once_and_tracks_entry() {
        let h = harness(FakeBroker::new(uptrend()));
        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;

        assert_eq!(result.status, CycleStatus::Executed);
        assert_eq!(result.order_id.as_deref(), Some("order-1"));
        assert_eq!(result.execution, Some(ExecutionStatus::Pending));
        assert_eq!(h.broker.submits(), 1);

        let signal = result.signal.as_ref().unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.strategy, StrategyKind::Momentum);

        // no history yet: probation halves the size
        let submitted = h.broker.submitted.lock().unwrap()[0].clone();
        assert_eq!(submitted.side, OrderSide::Buy);
        assert_eq!(submitted.amount, OrderAmount::Notional(dec!(250)));

        let entry = h.positions.get("AAPL").unwrap();
        assert_eq!(entry.order_id, "order-1");
        assert_eq!(entry.strategy, StrategyKind::Momentum);
        assert!((entry.quantity - 250.0 / signal.entry_price).abs() < 1e-9);
        assert_eq!(h.store.trade_statuses(), vec!["pending"]);
        assert_invariants(&result);
    }

    #[tokio::test]
    async fn test_quantity_request_is_truncated() {
        let h = harness(FakeBroker::new(uptrend()));
        let request = CycleRequest::quantity("AAPL", 3.0000003).with_strategy(StrategyKind::Momentum);
        let result = h.orchestrator.run_cycle(request).await;

        assert_eq!(result.status, CycleStatus::Executed);
        let submitted = h.broker.submitted.lock().unwrap()[0].clone();
        assert_eq!(submitted.amount, OrderAmount::Quantity(dec!(1.5)));
    }

    #[tokio::test]
    async fn test_flat_market_holds_without_size() {
        let h = harness(FakeBroker::new(bars_from_closes(&[100.0; 100])));
        let request = CycleRequest {
            symbol: "AAPL".to_string(),
            strategy: Some("momentum".to_string()),
            ..CycleRequest::default()
        };
        let result = h.orchestrator.run_cycle(request).await;

        assert_eq!(result.status, CycleStatus::Hold);
        assert!(result.risk.is_none());
        assert_eq!(h.broker.submits(), 0);
        assert_invariants(&result);
    }

    #[tokio::test]
    async fn test_exposure_rejection_is_idempotent() {
        let mut broker = FakeBroker::new(uptrend());
        broker.positions = vec![PositionSnapshot {
            symbol: "MSFT".to_string(),
            quantity: 10.0,
            avg_entry_price: 490.0,
            current_price: 490.0,
            market_value: 4_900.0,
            unrealized_pnl: 0.0,
        }];
        let h = harness(broker);

        // 400 requested, 200 after probation: 4,900 + 200 crosses 50% of 10,000
        let first = h.orchestrator.run_cycle(momentum_buy(400.0)).await;
        let second = h.orchestrator.run_cycle(momentum_buy(400.0)).await;

        assert_eq!(first.status, CycleStatus::Rejected);
        assert_eq!(second.status, CycleStatus::Rejected);
        let (a, b) = (first.risk.unwrap(), second.risk.unwrap());
        assert_eq!(a.reasons, b.reasons);
        assert!(a.reasons[0].contains("exposure"));
        assert_eq!(h.broker.submits(), 0);
    }

    #[tokio::test]
    async fn test_missing_data_is_an_error() {
        let broker = FakeBroker::new(Vec::new());
        *broker.bars.lock().unwrap() = Err(BrokerError::DataUnavailable("no bars for ZZZZ".into()));
        let h = harness(broker);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("market data unavailable"));
        assert!(result.signal.is_none());
        assert_eq!(h.broker.submits(), 0);
    }

    #[tokio::test]
    async fn test_short_history_is_an_error() {
        let h = harness(FakeBroker::new(bars_from_closes(&[100.0; 30])));
        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("Insufficient data"));
    }

    #[tokio::test]
    async fn test_slow_market_data_times_out() {
        let mut broker = FakeBroker::new(uptrend());
        broker.bars_delay = Duration::from_secs(2);
        let h = harness(broker);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("market data timed out"));
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_before_io() {
        let h = harness(FakeBroker::new(uptrend()));

        let unknown = CycleRequest::notional("AAPL", 500.0);
        let unknown = CycleRequest {
            strategy: Some("astrology".to_string()),
            ..unknown
        };
        let result = h.orchestrator.run_cycle(unknown).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("invalid cycle request"));
        assert_eq!(h.broker.bar_calls.load(Ordering::SeqCst), 0);

        let both = CycleRequest {
            quantity: Some(2.0),
            ..momentum_buy(500.0)
        };
        let result = h.orchestrator.run_cycle(both).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("not both"));
        assert_eq!(h.broker.submits(), 0);
    }

    #[tokio::test]
    async fn test_broker_rejection_is_recorded_not_retried() {
        let mut broker = FakeBroker::new(uptrend());
        broker.submit_error = Some(BrokerError::Rejected("insufficient buying power".into()));
        let h = harness(broker);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("insufficient buying power"));
        assert!(result.risk.as_ref().unwrap().approved);
        assert!(result.order_id.is_none());
        assert_eq!(h.broker.submits(), 1);
        assert_eq!(h.store.trade_statuses(), vec!["failed"]);
        assert!(h.positions.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_ack_is_an_error() {
        let mut broker = FakeBroker::new(uptrend());
        broker.fill = OrderStatus::Rejected;
        let h = harness(broker);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert_eq!(h.store.trade_statuses(), vec!["broker_rejected"]);
        assert_invariants(&result);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_executed_status() {
        let h = harness(FakeBroker::new(uptrend()));
        h.store.failing.store(true, Ordering::SeqCst);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Executed);
        assert_eq!(h.broker.submits(), 1);
        assert!(h.recorder.pending_len() > 0);

        h.store.failing.store(false, Ordering::SeqCst);
        h.recorder.flush_pending().await;
        assert_eq!(h.recorder.pending_len(), 0);
        assert_eq!(h.store.trade_statuses(), vec!["pending"]);
    }

    #[tokio::test]
    async fn test_invariants_hold_across_outcomes() {
        let scenarios = vec![
            (FakeBroker::new(uptrend()), momentum_buy(500.0)),
            (FakeBroker::new(uptrend()), momentum_buy(500.0).dry_run(true)),
            (FakeBroker::new(uptrend()), momentum_buy(0.0)),
            (FakeBroker::new(bars_from_closes(&[100.0; 100])), momentum_buy(500.0)),
            (FakeBroker::new(Vec::new()), momentum_buy(500.0)),
        ];
        for (broker, request) in scenarios {
            let h = harness(broker);
            let result = h.orchestrator.run_cycle(request).await;
            assert_invariants(&result);
        }
    }

    // -----------------------------------------------------------------------
    // Close loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_target_hit_closes_and_feeds_learning() {
        let h = harness(FakeBroker::new(uptrend()));
        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Executed);
        let target = result.signal.as_ref().unwrap().take_profit.unwrap();

        // nothing touched yet: the latest bar predates the entry
        assert!(h.positions.monitor_open_entries().await.is_empty());
        assert_eq!(h.positions.len(), 1);

        let mut bars = uptrend();
        bars.push(Bar {
            timestamp: Utc::now(),
            open: target - 1.0,
            high: target + 2.0,
            low: target - 1.5,
            close: target + 1.0,
            volume: 1_000_000.0,
            vwap: None,
        });
        h.broker.set_bars(bars);

        let closed = h.positions.monitor_open_entries().await;
        assert_eq!(closed.len(), 1);
        let trade = &closed[0];
        assert!((trade.exit_price - target).abs() < 1e-9);
        assert!(trade.pnl > 0.0);
        assert!(h.positions.is_empty());

        assert_eq!(h.broker.submits(), 2);
        let close_order = h.broker.submitted.lock().unwrap()[1].clone();
        assert_eq!(close_order.side, OrderSide::Sell);
        assert!(matches!(close_order.amount, OrderAmount::Quantity(_)));

        let perf = h.learning.committed("momentum").unwrap();
        assert_eq!(perf.total_trades, 1);
        assert_eq!(perf.winning_trades, 1);
        assert_eq!(h.store.trade_statuses(), vec!["pending", "closed"]);
    }

    #[tokio::test]
    async fn test_same_side_entries_merge() {
        let h = harness(FakeBroker::new(uptrend()));
        h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        h.orchestrator.run_cycle(momentum_buy(500.0)).await;

        assert_eq!(h.positions.len(), 1);
        let entry = h.positions.get("AAPL").unwrap();
        assert!((entry.quantity - 500.0 / 199.0).abs() < 1e-9);
        assert!((entry.levels.entry_price - 199.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_submit_timeout_is_recorded_for_reconciliation() {
        let mut broker = FakeBroker::new(uptrend());
        broker.submit_delay = Duration::from_secs(2);
        let h = harness(broker);

        let result = h.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(h.broker.submits(), 1);
        assert_eq!(h.store.trade_statuses(), vec!["submit_timeout"]);
        assert!(h.positions.is_empty());
    }

    #[tokio::test]
    async fn test_drawdown_peak_survives_restart() {
        let first = harness(FakeBroker::new(uptrend()));
        first.orchestrator.run_cycle(momentum_buy(500.0).dry_run(true)).await;
        first.orchestrator.run_cycle(momentum_buy(500.0).dry_run(true)).await;
        assert_eq!(*first.store.peaks.lock().unwrap(), vec![10_000.0]);

        // new process, account now 20% below the stored peak
        let peak = first.recorder.load_peak_equity().await.unwrap().unwrap_or(0.0);
        let mut broker = FakeBroker::new(uptrend());
        broker.account = AccountSnapshot {
            equity: 8_000.0,
            cash: 8_000.0,
            buying_power: 16_000.0,
            last_equity: 8_000.0,
        };
        let restarted = harness_with(
            broker,
            first.store.clone(),
            RiskEngine::new(RiskParameters::default()).with_peak_equity(peak),
        );

        let result = restarted.orchestrator.run_cycle(momentum_buy(500.0)).await;
        assert_eq!(result.status, CycleStatus::Rejected);
        assert!(result.risk.unwrap().reasons[0].contains("drawdown"));
        assert_eq!(restarted.broker.submits(), 0);
        assert_eq!(*restarted.store.peaks.lock().unwrap(), vec![10_000.0]);
    }

    #[tokio::test]
    async fn test_quantity_added_during_close_stays_tracked() {
        let h = harness(FakeBroker::new(uptrend()));
        let levels = strategy_engine::ExitLevels {
            side: SignalAction::Buy,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
        };
        let entry = OpenEntry {
            cycle_id: "cycle-1".to_string(),
            symbol: "AAPL".to_string(),
            strategy: StrategyKind::Momentum,
            side: OrderSide::Buy,
            quantity: 1.0,
            levels,
            order_id: "order-a".to_string(),
            opened_at: Utc::now(),
        };
        h.positions.track(entry.clone());
        let snapshot = h.positions.get("AAPL").unwrap();

        // another cycle adds to the position before the close lands
        h.positions.track(OpenEntry {
            cycle_id: "cycle-2".to_string(),
            quantity: 2.0,
            order_id: "order-b".to_string(),
            ..entry
        });

        let exit = ExitDecision {
            reason: ExitReason::TakeProfit,
            price: 110.0,
        };
        let closed = h.positions.close(snapshot, exit).await.unwrap();
        assert!((closed.pnl - 10.0).abs() < 1e-9);

        let remaining = h.positions.get("AAPL").unwrap();
        assert!((remaining.quantity - 2.0).abs() < 1e-9);
        assert_eq!(remaining.order_id, "order-a");

        let close_order = h.broker.submitted.lock().unwrap()[0].clone();
        assert_eq!(close_order.amount, OrderAmount::Quantity(dec!(1)));
    }
}
