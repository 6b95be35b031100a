use std::str::FromStr;
use std::time::Duration;

use analysis_core::Timeframe;
use analytics::LearningConfig;
use anyhow::{bail, Context, Result};
use risk_manager::RiskParameters;
use strategy_engine::{ScorerConfig, MIN_BARS};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub risk: RiskParameters,
    pub scorer: ScorerConfig,
    pub learning: LearningConfig,

    // Timeouts
    pub broker_timeout_ms: u64,
    pub persistence_timeout_ms: u64,

    // Market data
    pub bar_timeframe: Timeframe,
    pub bar_limit: usize,

    // Agent loop
    pub scan_interval_seconds: u64,
    pub watchlist: Vec<String>,
    pub default_notional: f64,
    pub dry_run: bool,
    /// Pin every cycle to the scorer's active strategy instead of consensus
    pub follow_active_strategy: bool,
    pub max_concurrent_cycles: usize,
    pub metrics_log_interval_cycles: u64,

    // Alpaca
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,

    pub database_url: String,
    /// Identity the persisted statistics belong to
    pub owner: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let risk_defaults = RiskParameters::default();
        let scorer_defaults = ScorerConfig::default();
        let learning_defaults = LearningConfig::default();

        let config = Self {
            risk: RiskParameters {
                min_confidence: parse(&lookup, "MIN_CONFIDENCE", risk_defaults.min_confidence)?,
                max_open_positions: parse(
                    &lookup,
                    "MAX_OPEN_POSITIONS",
                    risk_defaults.max_open_positions,
                )?,
                max_exposure: parse(&lookup, "MAX_EXPOSURE", risk_defaults.max_exposure)?,
                max_position_size: parse(
                    &lookup,
                    "MAX_POSITION_SIZE",
                    risk_defaults.max_position_size,
                )?,
                max_daily_loss: parse(&lookup, "MAX_DAILY_LOSS", risk_defaults.max_daily_loss)?,
                max_drawdown: parse(&lookup, "MAX_DRAWDOWN", risk_defaults.max_drawdown)?,
            },
            scorer: ScorerConfig {
                min_confidence: parse(
                    &lookup,
                    "MIN_STRATEGY_CONFIDENCE",
                    scorer_defaults.min_confidence,
                )?,
                auto_switch_threshold: parse(
                    &lookup,
                    "AUTO_SWITCH_THRESHOLD",
                    scorer_defaults.auto_switch_threshold,
                )?,
                auto_switch_min_trades: parse(
                    &lookup,
                    "AUTO_SWITCH_MIN_TRADES",
                    scorer_defaults.auto_switch_min_trades,
                )?,
                min_scoring_trades: parse(
                    &lookup,
                    "MIN_SCORING_TRADES",
                    scorer_defaults.min_scoring_trades,
                )?,
            },
            learning: LearningConfig {
                testing_window: parse(
                    &lookup,
                    "TESTING_WINDOW_TRADES",
                    learning_defaults.testing_window,
                )?,
                probation_size_factor: parse(
                    &lookup,
                    "PROBATION_SIZE_FACTOR",
                    learning_defaults.probation_size_factor,
                )?,
            },

            broker_timeout_ms: parse(&lookup, "BROKER_TIMEOUT_MS", 10_000)?,
            persistence_timeout_ms: parse(&lookup, "PERSISTENCE_TIMEOUT_MS", 3_000)?,

            bar_timeframe: parse(&lookup, "BAR_TIMEFRAME", Timeframe::Day1)?,
            bar_limit: parse(&lookup, "BAR_LIMIT", 100)?,

            scan_interval_seconds: parse(&lookup, "SCAN_INTERVAL", 300)?,
            watchlist: get("WATCHLIST", "AAPL,MSFT,GOOGL,AMZN,NVDA,SPY")
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            default_notional: parse(&lookup, "DEFAULT_NOTIONAL", 500.0)?,
            dry_run: parse(&lookup, "DRY_RUN", true)?,
            follow_active_strategy: parse(&lookup, "FOLLOW_ACTIVE_STRATEGY", false)?,
            max_concurrent_cycles: parse(&lookup, "MAX_CONCURRENT_CYCLES", 4)?,
            metrics_log_interval_cycles: parse(&lookup, "METRICS_LOG_INTERVAL_CYCLES", 10)?,

            alpaca_api_key: lookup("ALPACA_API_KEY")
                .or_else(|| lookup("APCA_API_KEY_ID"))
                .context("ALPACA_API_KEY not set")?,
            alpaca_secret_key: lookup("ALPACA_SECRET_KEY")
                .or_else(|| lookup("APCA_API_SECRET_KEY"))
                .context("ALPACA_SECRET_KEY not set")?,
            alpaca_base_url: get("ALPACA_BASE_URL", alpaca_broker::PAPER_URL),
            alpaca_data_url: get("ALPACA_DATA_URL", alpaca_broker::DATA_URL),

            database_url: get("DATABASE_URL", "sqlite:trading_agent.db?mode=rwc"),
            owner: get("AGENT_OWNER", "default"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every cycle fail or trade unbounded.
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("MIN_CONFIDENCE", self.risk.min_confidence),
            ("MAX_EXPOSURE", self.risk.max_exposure),
            ("MAX_POSITION_SIZE", self.risk.max_position_size),
            ("MAX_DAILY_LOSS", self.risk.max_daily_loss),
            ("MAX_DRAWDOWN", self.risk.max_drawdown),
            ("MIN_STRATEGY_CONFIDENCE", self.scorer.min_confidence),
            ("PROBATION_SIZE_FACTOR", self.learning.probation_size_factor),
        ];
        for (key, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{} must be in (0, 1], got {}", key, value);
            }
        }
        if self.bar_limit < MIN_BARS {
            bail!("BAR_LIMIT must be at least {} (indicator warmup), got {}", MIN_BARS, self.bar_limit);
        }
        if self.watchlist.is_empty() {
            bail!("WATCHLIST is empty");
        }
        if !(self.default_notional > 0.0) {
            bail!("DEFAULT_NOTIONAL must be positive, got {}", self.default_notional);
        }
        if self.max_concurrent_cycles == 0 {
            bail!("MAX_CONCURRENT_CYCLES must be at least 1");
        }
        if self.scan_interval_seconds == 0 {
            bail!("SCAN_INTERVAL must be at least 1 second");
        }
        if self.broker_timeout_ms == 0 || self.persistence_timeout_ms == 0 {
            bail!("timeouts must be non-zero");
        }
        Ok(())
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
