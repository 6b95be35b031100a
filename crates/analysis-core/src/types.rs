use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::AnalysisError;

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: Option<f64>,
}

/// Directional recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    /// +1 for long entries, -1 for short entries, 0 for HOLD
    pub fn direction(&self) -> f64 {
        match self {
            SignalAction::Buy => 1.0,
            SignalAction::Sell => -1.0,
            SignalAction::Hold => 0.0,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of strategy algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Momentum,
    MeanReversion,
    Breakout,
    Technical,
    EnhancedMeanReversion,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Momentum,
        StrategyKind::MeanReversion,
        StrategyKind::Breakout,
        StrategyKind::Technical,
        StrategyKind::EnhancedMeanReversion,
    ];

    /// Stable identifier used as the persistence key.
    pub fn id(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
            StrategyKind::Technical => "technical",
            StrategyKind::EnhancedMeanReversion => "enhanced_mean_reversion",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for StrategyKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.id() == normalized)
            .ok_or_else(|| AnalysisError::InvalidData(format!("unknown strategy '{}'", s)))
    }
}

/// One strategy's opinion for a symbol at a point in time.
///
/// Signals are produced by the strategy evaluators and passed around by
/// reference afterwards; a forced HOLD is a new signal built with
/// [`Signal::to_hold`], never an edit of the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64, // 0.0 to 1.0
    pub strategy: StrategyKind,
    pub timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Named indicator values the decision was based on
    pub indicators: BTreeMap<String, f64>,
    pub reason: String,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }

    /// Copy of this signal with the action downgraded to HOLD.
    pub fn to_hold(&self, reason: impl Into<String>) -> Signal {
        Signal {
            action: SignalAction::Hold,
            stop_loss: None,
            take_profit: None,
            reason: reason.into(),
            ..self.clone()
        }
    }
}

/// Timeframe for bar requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour4,
    Day1,
    Week1,
    Month1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
            Timeframe::Week1 => 10080,
            Timeframe::Month1 => 43200,
        }
    }

    /// Alpaca-style timeframe string ("15Min", "1Day", ...)
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1Min",
            Timeframe::Minute5 => "5Min",
            Timeframe::Minute15 => "15Min",
            Timeframe::Minute30 => "30Min",
            Timeframe::Hour1 => "1Hour",
            Timeframe::Hour4 => "4Hour",
            Timeframe::Day1 => "1Day",
            Timeframe::Week1 => "1Week",
            Timeframe::Month1 => "1Month",
        }
    }
}

impl FromStr for Timeframe {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1min" | "1m" => Ok(Timeframe::Minute1),
            "5min" | "5m" => Ok(Timeframe::Minute5),
            "15min" | "15m" => Ok(Timeframe::Minute15),
            "30min" | "30m" => Ok(Timeframe::Minute30),
            "1hour" | "1h" => Ok(Timeframe::Hour1),
            "4hour" | "4h" => Ok(Timeframe::Hour4),
            "1day" | "1d" | "daily" => Ok(Timeframe::Day1),
            "1week" | "1w" | "weekly" => Ok(Timeframe::Week1),
            "1month" | "monthly" => Ok(Timeframe::Month1),
            other => Err(AnalysisError::InvalidData(format!("unknown timeframe '{}'", other))),
        }
    }
}
