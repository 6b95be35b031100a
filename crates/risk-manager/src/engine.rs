use std::sync::Mutex;

use broker_trait::{AccountSnapshot, PositionSnapshot};

use crate::models::*;

/// Share of the risk score each limit contributes.
const SCORE_WEIGHTS: ScoreWeights = ScoreWeights {
    exposure: 0.30,
    size: 0.25,
    positions: 0.15,
    daily_loss: 0.10,
    drawdown: 0.10,
    confidence: 0.10,
};

struct ScoreWeights {
    exposure: f64,
    size: f64,
    positions: f64,
    daily_loss: f64,
    drawdown: f64,
    confidence: f64,
}

/// Validates proposed trades against portfolio and per-trade limits.
///
/// Stateless apart from the peak equity it has observed, which feeds the
/// drawdown breaker.
pub struct RiskEngine {
    params: RiskParameters,
    peak_equity: Mutex<f64>,
}

impl RiskEngine {
    pub fn new(params: RiskParameters) -> Self {
        Self {
            params,
            peak_equity: Mutex::new(0.0),
        }
    }

    /// Seed the peak from a previous session.
    pub fn with_peak_equity(self, peak: f64) -> Self {
        *self.peak_equity.lock().unwrap_or_else(|e| e.into_inner()) = peak.max(0.0);
        self
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    pub fn peak_equity(&self) -> f64 {
        *self.peak_equity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observe_equity(&self, equity: f64) -> f64 {
        let mut peak = self.peak_equity.lock().unwrap_or_else(|e| e.into_inner());
        if equity > *peak {
            *peak = equity;
        }
        *peak
    }

    /// Run the checks in order, stopping at the first hard failure.
    pub fn assess_trade_risk(
        &self,
        proposal: &TradeProposal,
        account: &AccountSnapshot,
        positions: &[PositionSnapshot],
    ) -> RiskAssessment {
        let p = &self.params;
        let equity = account.equity;
        let peak = self.observe_equity(equity);
        let requested = proposal.requested_notional();
        let existing: f64 = positions.iter().map(|pos| pos.exposure()).sum();
        let risk_score = self.risk_score(proposal, account, positions, peak);

        let reject = |reason: String| {
            tracing::debug!(
                symbol = %proposal.signal.symbol,
                risk_score,
                "Risk check rejected: {}",
                reason
            );
            RiskAssessment {
                approved: false,
                risk_score,
                reasons: vec![reason],
                sizing: proposal.sizing,
            }
        };

        if !proposal.sizing.is_positive() || !requested.is_finite() || requested <= 0.0 {
            return reject("trade size must be positive".to_string());
        }

        if proposal.is_exit {
            return RiskAssessment {
                approved: true,
                risk_score,
                reasons: vec!["exit order: entry limits not applied".to_string()],
                sizing: proposal.sizing,
            };
        }

        if equity <= 0.0 {
            return reject(format!("account equity ${:.2} leaves no room to trade", equity));
        }

        // 1. Confidence floor
        let confidence = proposal.signal.confidence;
        if confidence < p.min_confidence {
            return reject(format!(
                "confidence below threshold ({:.2} < {:.2})",
                confidence, p.min_confidence
            ));
        }

        // 2. Position count; adding to an existing holding does not open a slot
        let already_held = positions.iter().any(|pos| pos.symbol == proposal.signal.symbol);
        if !already_held && positions.len() >= p.max_open_positions {
            return reject(format!(
                "position limit reached ({} open, max {})",
                positions.len(),
                p.max_open_positions
            ));
        }

        // 3. Gross exposure including this trade
        let exposure_ratio = (existing + requested) / equity;
        if exposure_ratio >= p.max_exposure {
            return reject(format!(
                "exposure would reach {:.1}% of equity (max {:.1}%)",
                exposure_ratio * 100.0,
                p.max_exposure * 100.0
            ));
        }

        // 4. Per-trade size: soft cap
        let mut reasons = Vec::new();
        let mut sizing = proposal.sizing;
        let cap = p.max_position_size * equity;
        if requested > cap {
            sizing = proposal.sizing.scaled(cap / requested);
            reasons.push(format!(
                "position size clamped from ${:.2} to ${:.2} ({:.0}% of equity)",
                requested,
                cap,
                p.max_position_size * 100.0
            ));
        }

        // 5. Daily loss breaker
        let daily_loss = daily_loss_fraction(account);
        if daily_loss > p.max_daily_loss {
            return reject(format!(
                "daily loss circuit breaker: down {:.2}% today (max {:.1}%)",
                daily_loss * 100.0,
                p.max_daily_loss * 100.0
            ));
        }

        // 6. Drawdown breaker
        let drawdown = drawdown_fraction(equity, peak);
        if drawdown > p.max_drawdown {
            return reject(format!(
                "drawdown circuit breaker: {:.2}% below peak ${:.2} (max {:.1}%)",
                drawdown * 100.0,
                peak,
                p.max_drawdown * 100.0
            ));
        }

        tracing::debug!(
            symbol = %proposal.signal.symbol,
            risk_score,
            exposure_pct = exposure_ratio * 100.0,
            "Risk check approved"
        );

        RiskAssessment {
            approved: true,
            risk_score,
            reasons,
            sizing,
        }
    }

    /// Weighted closeness to each limit, 0..100. Uses the requested size so
    /// the score grows with the trade even when sizing gets clamped.
    fn risk_score(
        &self,
        proposal: &TradeProposal,
        account: &AccountSnapshot,
        positions: &[PositionSnapshot],
        peak: f64,
    ) -> f64 {
        let p = &self.params;
        let w = &SCORE_WEIGHTS;
        let equity = account.equity;
        if equity <= 0.0 {
            return 100.0;
        }

        let requested = proposal.requested_notional().max(0.0);
        let existing: f64 = positions.iter().map(|pos| pos.exposure()).sum();

        let exposure = utilization((existing + requested) / equity, p.max_exposure);
        let size = utilization(requested / equity, p.max_position_size);
        let slots = utilization(positions.len() as f64, p.max_open_positions as f64);
        let daily = utilization(daily_loss_fraction(account), p.max_daily_loss);
        let drawdown = utilization(drawdown_fraction(equity, peak), p.max_drawdown);
        let doubt = (1.0 - proposal.signal.confidence).clamp(0.0, 1.0);

        let score = w.exposure * exposure
            + w.size * size
            + w.positions * slots
            + w.daily_loss * daily
            + w.drawdown * drawdown
            + w.confidence * doubt;
        (score * 100.0).clamp(0.0, 100.0)
    }
}

fn utilization(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 1.0;
    }
    (value / limit).clamp(0.0, 1.0)
}

fn daily_loss_fraction(account: &AccountSnapshot) -> f64 {
    if account.last_equity <= 0.0 {
        return 0.0;
    }
    (-account.daily_pnl() / account.last_equity).max(0.0)
}

fn drawdown_fraction(equity: f64, peak: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - equity) / peak).max(0.0)
}
