use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use analysis_core::{AnalysisError, Bar, Signal, SignalAction, StrategyKind, StrategyPerformance};
use serde::{Deserialize, Serialize};

use crate::evaluator::StrategyEvaluator;
use crate::scoring::composite_score;

/// Read-only view of the last committed per-strategy statistics.
///
/// Reads never block on in-flight updates; a value one trade stale is fine.
pub trait PerformanceSource: Send + Sync {
    fn snapshot(&self, kind: StrategyKind) -> Option<StrategyPerformance>;
}

impl PerformanceSource for HashMap<StrategyKind, StrategyPerformance> {
    fn snapshot(&self, kind: StrategyKind) -> Option<StrategyPerformance> {
        self.get(&kind).cloned()
    }
}

/// Source with no recorded trades; every strategy scores zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

impl PerformanceSource for NoHistory {
    fn snapshot(&self, _kind: StrategyKind) -> Option<StrategyPerformance> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Below this every signal is ignored and the recommendation is HOLD
    pub min_confidence: f64,
    /// Score points an alternative must lead the active strategy by
    pub auto_switch_threshold: f64,
    /// Trades the alternative needs before a switch is considered
    pub auto_switch_min_trades: u32,
    /// Trades before the full composite formula replaces the bootstrap score
    pub min_scoring_trades: u32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.60,
            auto_switch_threshold: 10.0,
            auto_switch_min_trades: 20,
            min_scoring_trades: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyScore {
    pub strategy: StrategyKind,
    pub score: f64,
    pub total_trades: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySwitch {
    pub from: StrategyKind,
    pub to: StrategyKind,
    pub from_score: f64,
    pub to_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiStrategyAnalysis {
    pub symbol: String,
    pub all_signals: Vec<Signal>,
    /// Strategies that could not evaluate, with the reason
    pub skipped: Vec<(StrategyKind, String)>,
    pub recommended_signal: Signal,
    /// Fraction of evaluated strategies agreeing with the majority action
    pub consensus: f64,
    pub majority_action: SignalAction,
}

impl MultiStrategyAnalysis {
    pub fn signal_for(&self, kind: StrategyKind) -> Option<&Signal> {
        self.all_signals.iter().find(|s| s.strategy == kind)
    }
}

/// Runs every registered strategy over the same bars and picks one
/// recommendation, weighting strategies by their recorded performance.
pub struct MultiStrategyScorer {
    strategies: Vec<StrategyKind>,
    config: ScorerConfig,
    performance: Arc<dyn PerformanceSource>,
    active: RwLock<StrategyKind>,
}

impl MultiStrategyScorer {
    pub fn new(config: ScorerConfig, performance: Arc<dyn PerformanceSource>) -> Self {
        Self::with_strategies(StrategyKind::ALL.to_vec(), config, performance)
    }

    pub fn with_strategies(
        strategies: Vec<StrategyKind>,
        config: ScorerConfig,
        performance: Arc<dyn PerformanceSource>,
    ) -> Self {
        let active = strategies.first().copied().unwrap_or(StrategyKind::Momentum);
        Self {
            strategies,
            config,
            performance,
            active: RwLock::new(active),
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn strategies(&self) -> &[StrategyKind] {
        &self.strategies
    }

    pub fn analyze_all_strategies(
        &self,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<MultiStrategyAnalysis, AnalysisError> {
        let mut all_signals = Vec::with_capacity(self.strategies.len());
        let mut skipped = Vec::new();
        let mut first_error = None;

        for kind in &self.strategies {
            match kind.evaluate(symbol, bars) {
                Ok(signal) => {
                    tracing::debug!(
                        strategy = kind.id(),
                        action = signal.action.as_str(),
                        confidence = signal.confidence,
                        "{}",
                        signal.reason
                    );
                    all_signals.push(signal);
                }
                Err(e) => {
                    tracing::debug!(strategy = kind.id(), error = %e, "Strategy skipped");
                    skipped.push((*kind, e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }

        if all_signals.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                AnalysisError::NoUsableSignal(format!("no strategies registered for {}", symbol))
            }));
        }

        let (majority_action, majority_count) = majority(&all_signals);
        let consensus = majority_count as f64 / all_signals.len() as f64;
        let recommended_signal = self.pick_recommendation(&all_signals, majority_action);

        Ok(MultiStrategyAnalysis {
            symbol: symbol.to_string(),
            all_signals,
            skipped,
            recommended_signal,
            consensus,
            majority_action,
        })
    }

    fn pick_recommendation(&self, signals: &[Signal], majority_action: SignalAction) -> Signal {
        let qualifying: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.action == majority_action && s.action != SignalAction::Hold)
            .filter(|s| s.confidence >= self.config.min_confidence)
            .collect();

        let best = qualifying
            .into_iter()
            .map(|s| (self.score_of(s.strategy), s))
            .max_by(|(score_a, a), (score_b, b)| {
                score_a
                    .total_cmp(score_b)
                    .then(a.confidence.total_cmp(&b.confidence))
            })
            .map(|(_, s)| s);

        match best {
            Some(signal) => signal.clone(),
            None => {
                let base = signals
                    .iter()
                    .filter(|s| s.action == majority_action)
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                    .unwrap_or(&signals[0]);
                let reason = if majority_action == SignalAction::Hold {
                    "No directional majority across strategies".to_string()
                } else {
                    format!(
                        "No {} signal reached minimum confidence {:.2}",
                        majority_action, self.config.min_confidence
                    )
                };
                base.to_hold(reason)
            }
        }
    }

    /// Recommendation when the caller pins one strategy instead of consensus.
    pub fn recommend_for(
        &self,
        analysis: &MultiStrategyAnalysis,
        kind: StrategyKind,
    ) -> Result<Signal, AnalysisError> {
        let signal = analysis.signal_for(kind).ok_or_else(|| {
            let why = analysis
                .skipped
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, reason)| reason.clone())
                .unwrap_or_else(|| "strategy not registered".to_string());
            AnalysisError::NoUsableSignal(format!("{}: {}", kind, why))
        })?;

        if signal.is_actionable() && signal.confidence < self.config.min_confidence {
            return Ok(signal.to_hold(format!(
                "{} confidence {:.2} below minimum {:.2}",
                kind, signal.confidence, self.config.min_confidence
            )));
        }
        Ok(signal.clone())
    }

    pub fn score_of(&self, kind: StrategyKind) -> f64 {
        self.performance
            .snapshot(kind)
            .map(|p| composite_score(&p, self.config.min_scoring_trades))
            .unwrap_or(0.0)
    }

    /// Every registered strategy's composite score, highest first.
    pub fn rankings(&self) -> Vec<StrategyScore> {
        let mut scores: Vec<StrategyScore> = self
            .strategies
            .iter()
            .map(|&kind| {
                let perf = self.performance.snapshot(kind);
                StrategyScore {
                    strategy: kind,
                    score: perf
                        .as_ref()
                        .map(|p| composite_score(p, self.config.min_scoring_trades))
                        .unwrap_or(0.0),
                    total_trades: perf.map(|p| p.total_trades).unwrap_or(0),
                }
            })
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.strategy.cmp(&b.strategy)));
        scores
    }

    pub fn active_strategy(&self) -> StrategyKind {
        *self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_active_strategy(&self, kind: StrategyKind) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    /// Switch the active strategy when an alternative with enough trades
    /// leads it by at least the configured threshold.
    pub fn evaluate_auto_switch(&self) -> Option<StrategySwitch> {
        let current = self.active_strategy();
        let current_score = self.score_of(current);

        let best = self
            .rankings()
            .into_iter()
            .filter(|s| s.strategy != current)
            .find(|s| s.total_trades >= self.config.auto_switch_min_trades)?;

        if best.score - current_score < self.config.auto_switch_threshold {
            return None;
        }

        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        // another caller may have switched while we were scoring
        if *active != current {
            return None;
        }
        *active = best.strategy;

        tracing::info!(
            from = current.id(),
            to = best.strategy.id(),
            from_score = current_score,
            to_score = best.score,
            "Auto-switching active strategy"
        );

        Some(StrategySwitch {
            from: current,
            to: best.strategy,
            from_score: current_score,
            to_score: best.score,
        })
    }
}

/// Most common action; a tie for first place resolves to HOLD.
fn majority(signals: &[Signal]) -> (SignalAction, usize) {
    let count = |action: SignalAction| signals.iter().filter(|s| s.action == action).count();
    let tallies = [
        (SignalAction::Buy, count(SignalAction::Buy)),
        (SignalAction::Sell, count(SignalAction::Sell)),
        (SignalAction::Hold, count(SignalAction::Hold)),
    ];
    let top = tallies.iter().map(|(_, n)| *n).max().unwrap_or(0);
    let leaders: Vec<_> = tallies.iter().filter(|(_, n)| *n == top).collect();
    if leaders.len() == 1 {
        *leaders[0]
    } else {
        (SignalAction::Hold, top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bars_from_closes, rising_bars};
    use std::collections::BTreeMap;

    fn signal(kind: StrategyKind, action: SignalAction, confidence: f64) -> Signal {
        Signal {
            symbol: "AAPL".to_string(),
            action,
            confidence,
            strategy: kind,
            timestamp: chrono::Utc::now(),
            entry_price: 100.0,
            stop_loss: None,
            take_profit: None,
            indicators: BTreeMap::new(),
            reason: String::new(),
        }
    }

    fn history(entries: &[(StrategyKind, &[f64])]) -> Arc<dyn PerformanceSource> {
        let mut map = HashMap::new();
        for (kind, pnls) in entries {
            let mut perf = StrategyPerformance::new(kind.id());
            for &p in *pnls {
                perf.apply_trade(p, 7);
            }
            map.insert(*kind, perf);
        }
        Arc::new(map)
    }

    #[test]
    fn tie_for_majority_is_hold() {
        let signals = vec![
            signal(StrategyKind::Momentum, SignalAction::Buy, 0.8),
            signal(StrategyKind::Breakout, SignalAction::Sell, 0.8),
        ];
        assert_eq!(majority(&signals), (SignalAction::Hold, 1));
    }

    #[test]
    fn low_confidence_forces_hold() {
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), Arc::new(NoHistory));
        let signals = vec![
            signal(StrategyKind::Momentum, SignalAction::Buy, 0.55),
            signal(StrategyKind::Breakout, SignalAction::Buy, 0.59),
            signal(StrategyKind::Technical, SignalAction::Hold, 0.5),
        ];
        let pick = scorer.pick_recommendation(&signals, SignalAction::Buy);
        assert_eq!(pick.action, SignalAction::Hold);
        assert!(pick.stop_loss.is_none());
    }

    #[test]
    fn best_scoring_strategy_wins_over_confidence() {
        let perf = history(&[(StrategyKind::Breakout, &[30.0; 15])]);
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), perf);
        let signals = vec![
            signal(StrategyKind::Momentum, SignalAction::Buy, 0.9),
            signal(StrategyKind::Breakout, SignalAction::Buy, 0.65),
            signal(StrategyKind::Technical, SignalAction::Sell, 0.95),
        ];
        let pick = scorer.pick_recommendation(&signals, SignalAction::Buy);
        assert_eq!(pick.strategy, StrategyKind::Breakout);
    }

    #[test]
    fn equal_scores_break_ties_on_confidence() {
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), Arc::new(NoHistory));
        let signals = vec![
            signal(StrategyKind::Momentum, SignalAction::Sell, 0.7),
            signal(StrategyKind::Breakout, SignalAction::Sell, 0.8),
        ];
        let pick = scorer.pick_recommendation(&signals, SignalAction::Sell);
        assert_eq!(pick.strategy, StrategyKind::Breakout);
    }

    #[test]
    fn analysis_reports_consensus() {
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), Arc::new(NoHistory));
        let analysis = scorer.analyze_all_strategies("AAPL", &rising_bars(60)).unwrap();
        assert_eq!(analysis.all_signals.len(), 5);
        assert!(analysis.skipped.is_empty());
        let agreeing = analysis
            .all_signals
            .iter()
            .filter(|s| s.action == analysis.majority_action)
            .count();
        assert!((analysis.consensus - agreeing as f64 / 5.0).abs() < 1e-12);
        assert!(analysis.consensus > 0.0 && analysis.consensus <= 1.0);
    }

    #[test]
    fn short_series_fails_whole_analysis() {
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), Arc::new(NoHistory));
        let bars = bars_from_closes(&[100.0; 10]);
        let err = scorer.analyze_all_strategies("AAPL", &bars).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { actual: 10, .. }));
    }

    #[test]
    fn pinned_strategy_respects_min_confidence() {
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), Arc::new(NoHistory));
        let analysis = scorer.analyze_all_strategies("AAPL", &rising_bars(60)).unwrap();
        let pinned = scorer.recommend_for(&analysis, StrategyKind::Momentum).unwrap();
        assert_eq!(pinned.strategy, StrategyKind::Momentum);
        assert_eq!(pinned.action, SignalAction::Buy);

        let strict = MultiStrategyScorer::new(
            ScorerConfig { min_confidence: 0.99, ..ScorerConfig::default() },
            Arc::new(NoHistory),
        );
        let held = strict.recommend_for(&analysis, StrategyKind::Momentum).unwrap();
        assert_eq!(held.action, SignalAction::Hold);
    }

    #[test]
    fn auto_switch_requires_threshold_and_sample() {
        // breakout: strong record but too few trades
        let perf = history(&[
            (StrategyKind::Momentum, &[-20.0, 10.0].repeat(10)[..]),
            (StrategyKind::Breakout, &[50.0; 12]),
        ]);
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), perf);
        assert_eq!(scorer.active_strategy(), StrategyKind::Momentum);
        assert!(scorer.evaluate_auto_switch().is_none());

        let perf = history(&[
            (StrategyKind::Momentum, &[-20.0, 10.0].repeat(10)[..]),
            (StrategyKind::Breakout, &[50.0; 25]),
        ]);
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), perf);
        let switch = scorer.evaluate_auto_switch().unwrap();
        assert_eq!(switch.from, StrategyKind::Momentum);
        assert_eq!(switch.to, StrategyKind::Breakout);
        assert!(switch.to_score - switch.from_score >= 10.0);
        assert_eq!(scorer.active_strategy(), StrategyKind::Breakout);
        // already on the leader
        assert!(scorer.evaluate_auto_switch().is_none());
    }

    #[test]
    fn rankings_sorted_descending() {
        let perf = history(&[
            (StrategyKind::Technical, &[5.0; 3]),
            (StrategyKind::Breakout, &[5.0; 6]),
        ]);
        let scorer = MultiStrategyScorer::new(ScorerConfig::default(), perf);
        let ranks = scorer.rankings();
        assert_eq!(ranks.len(), 5);
        assert_eq!(ranks[0].strategy, StrategyKind::Breakout);
        assert_eq!(ranks[0].score, 30.0);
        assert_eq!(ranks[1].strategy, StrategyKind::Technical);
        for pair in ranks.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
