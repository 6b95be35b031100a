use std::sync::Arc;
use std::time::Duration;

use alpaca_broker::AlpacaClient;
use analysis_core::StrategyKind;
use analytics::{AnalyticsRecorder, LearningEngine, SqlPersistence};
use anyhow::{Context, Result};
use broker_trait::AccountPort;
use risk_manager::RiskEngine;
use strategy_engine::MultiStrategyScorer;
use tokio::signal::unix::SignalKind;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;

use trading_agent::{
    AgentConfig, AgentMetrics, CycleComponents, CycleRequest, CycleSettings, ExecutionRouter,
    PositionTracker, TradeCycleResult, TradingCycleOrchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting trading agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Owner: {}", config.owner);
    tracing::info!("  Watchlist: {}", config.watchlist.join(", "));
    tracing::info!(
        "  Bars: {} x {}",
        config.bar_limit,
        config.bar_timeframe.as_api_str()
    );
    tracing::info!("  Scan interval: {} seconds", config.scan_interval_seconds);
    tracing::info!("  Default notional: ${:.2}", config.default_notional);
    tracing::info!(
        "  Risk: max exposure {:.0}%, max position {:.0}%, max {} positions",
        config.risk.max_exposure * 100.0,
        config.risk.max_position_size * 100.0,
        config.risk.max_open_positions
    );
    tracing::info!(
        "  Dry run: {} (max {} concurrent cycles)",
        config.dry_run,
        config.max_concurrent_cycles
    );

    // 3. Broker
    let alpaca = Arc::new(AlpacaClient::new(
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
        config.alpaca_base_url.clone(),
        config.alpaca_data_url.clone(),
        config.broker_timeout(),
    )?);

    // 4. Safety gate: paper by default, live requires LIVE_TRADING_APPROVED=yes
    if !alpaca.is_paper() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "ALPACA_BASE_URL points to live trading ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or use \
                 https://paper-api.alpaca.markets for paper.",
                alpaca.base_url()
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE: REAL MONEY AT RISK ({})", alpaca.base_url());
    } else {
        tracing::info!("Paper trading mode ({})", alpaca.base_url());
    }

    // 5. Persistence and learning
    sqlx::any::install_default_drivers();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(config.persistence_timeout())
        .connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let store = SqlPersistence::new(pool, config.owner.clone());
    store.init_tables().await?;
    tracing::info!("Analytics tables ready");

    let recorder = Arc::new(AnalyticsRecorder::new(
        Arc::new(store),
        config.persistence_timeout(),
    ));
    let learning = Arc::new(LearningEngine::new(recorder.clone(), config.learning.clone()));
    match learning.warm(StrategyKind::ALL.iter().map(|k| k.id())).await {
        Ok(n) => tracing::info!("Loaded performance history for {} strategies", n),
        Err(e) => tracing::warn!("Starting without performance history: {:#}", e),
    }

    let peak_equity = match recorder.load_peak_equity().await {
        Ok(Some(peak)) => {
            tracing::info!("Restored equity peak ${:.2} for the drawdown breaker", peak);
            peak
        }
        Ok(None) => 0.0,
        Err(e) => {
            tracing::warn!("Equity peak unavailable, drawdown tracking starts fresh: {:#}", e);
            0.0
        }
    };

    // 6. Engines
    let scorer = Arc::new(MultiStrategyScorer::new(config.scorer.clone(), learning.clone()));
    let risk = Arc::new(RiskEngine::new(config.risk.clone()).with_peak_equity(peak_equity));
    let router = Arc::new(ExecutionRouter::new(alpaca.clone(), config.broker_timeout()));
    let positions = Arc::new(PositionTracker::new(
        alpaca.clone(),
        router.clone(),
        recorder.clone(),
        learning.clone(),
        scorer.clone(),
        config.bar_timeframe,
        config.broker_timeout(),
    ));
    let orchestrator = Arc::new(TradingCycleOrchestrator::new(
        config.owner.clone(),
        CycleComponents {
            market: alpaca.clone(),
            account: alpaca.clone(),
            scorer: scorer.clone(),
            risk,
            router,
            recorder: recorder.clone(),
            learning: learning.clone(),
            positions: positions.clone(),
        },
        CycleSettings {
            timeframe: config.bar_timeframe,
            bar_limit: config.bar_limit,
            broker_timeout: config.broker_timeout(),
        },
    ));

    for rank in scorer.rankings() {
        tracing::info!(
            "  {:<24} score {:>6.1} ({} trades)",
            rank.strategy.id(),
            rank.score,
            rank.total_trades
        );
    }

    // 7. Startup connectivity check
    let account = alpaca
        .get_account()
        .await
        .map_err(|e| anyhow::anyhow!("Alpaca connectivity check failed: {}", e))?;
    tracing::info!(
        "Account: ${:.2} equity, ${:.2} cash, ${:.2} buying power",
        account.equity,
        account.cash,
        account.buying_power
    );

    tracing::info!(
        "Agent is now running. Scanning every {}s. Press Ctrl+C to stop.",
        config.scan_interval_seconds
    );

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut metrics = AgentMetrics::new(config.metrics_log_interval_cycles);
    let permits = Arc::new(Semaphore::new(config.max_concurrent_cycles));
    let mut interval = time::interval(Duration::from_secs(config.scan_interval_seconds));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if recorder.pending_len() > 0 {
                    recorder.flush_pending().await;
                }
                if learning.deferred_len() > 0 {
                    learning.replay_deferred().await;
                }

                for closed in positions.monitor_open_entries().await {
                    metrics.record_close(&closed);
                }

                for result in run_watchlist(&orchestrator, &config, &permits).await {
                    metrics.record_cycle(&result);
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                let flushed = recorder.flush_pending().await;
                if recorder.pending_len() > 0 {
                    tracing::warn!(
                        "{} analytics writes still pending at shutdown ({} flushed)",
                        recorder.pending_len(),
                        flushed
                    );
                }
                metrics.log_metrics();
                break;
            }
        }
    }

    tracing::info!("Trading agent shut down.");
    Ok(())
}

/// One cycle per watchlist symbol, at most `permits` at a time.
async fn run_watchlist(
    orchestrator: &Arc<TradingCycleOrchestrator>,
    config: &AgentConfig,
    permits: &Arc<Semaphore>,
) -> Vec<TradeCycleResult> {
    let pinned = config
        .follow_active_strategy
        .then(|| orchestrator.scorer().active_strategy());

    let mut cycles = JoinSet::new();
    for symbol in &config.watchlist {
        let orchestrator = orchestrator.clone();
        let permits = permits.clone();
        let mut request =
            CycleRequest::notional(symbol.clone(), config.default_notional).dry_run(config.dry_run);
        if let Some(kind) = pinned {
            request = request.with_strategy(kind);
        }
        cycles.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            orchestrator.run_cycle(request).await
        });
    }

    let mut results = Vec::with_capacity(config.watchlist.len());
    while let Some(joined) = cycles.join_next().await {
        match joined {
            Ok(result) => {
                if let Some(err) = &result.error {
                    tracing::warn!("{}: cycle error: {}", result.symbol, err);
                }
                results.push(result);
            }
            Err(e) => tracing::error!("Cycle task panicked: {}", e),
        }
    }
    results
}
