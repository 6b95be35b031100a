use analysis_core::Signal;
use serde::{Deserialize, Serialize};

/// Portfolio and per-trade limits. Fractions are of account equity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub min_confidence: f64,
    pub max_open_positions: usize,
    /// Gross exposure including the new trade must stay below this
    pub max_exposure: f64,
    /// Soft cap: larger trades are clamped, not rejected
    pub max_position_size: f64,
    /// Loss since the previous close that halts new entries
    pub max_daily_loss: f64,
    /// Decline from peak equity that halts new entries
    pub max_drawdown: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            min_confidence: 0.60,
            max_open_positions: 10,
            max_exposure: 0.50,
            max_position_size: 0.10,
            max_daily_loss: 0.05,
            max_drawdown: 0.15,
        }
    }
}

/// Trade size as dollars or units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Sizing {
    Notional(f64),
    Quantity(f64),
}

impl Sizing {
    /// Dollar value at `price`.
    pub fn notional_at(&self, price: f64) -> f64 {
        match *self {
            Sizing::Notional(n) => n,
            Sizing::Quantity(q) => q * price,
        }
    }

    /// Same kind of sizing, scaled.
    pub fn scaled(&self, factor: f64) -> Sizing {
        match *self {
            Sizing::Notional(n) => Sizing::Notional(n * factor),
            Sizing::Quantity(q) => Sizing::Quantity(q * factor),
        }
    }

    pub fn is_positive(&self) -> bool {
        match *self {
            Sizing::Notional(v) | Sizing::Quantity(v) => v.is_finite() && v > 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub signal: Signal,
    pub sizing: Sizing,
    /// Closing trades bypass the entry limits and circuit breakers
    pub is_exit: bool,
}

impl TradeProposal {
    pub fn entry(signal: Signal, sizing: Sizing) -> Self {
        Self {
            signal,
            sizing,
            is_exit: false,
        }
    }

    pub fn requested_notional(&self) -> f64 {
        self.sizing.notional_at(self.signal.entry_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub approved: bool,
    /// 0..100, higher is closer to the limits. Informational only.
    pub risk_score: f64,
    /// Rejection reasons and caveats, in check order
    pub reasons: Vec<String>,
    /// Recommended size, never above the max-position-size cap
    pub sizing: Sizing,
}
