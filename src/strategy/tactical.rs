//! Tick-level decision making.
//!
//! Flat, the engine looks for an area of value near price that the regime
//! favors and demands directional force before advancing. Engaged, it scores
//! the evidence against the held side and manages the staged targets.

use std::fmt;

use crate::config::TacticalConfig;
use crate::execution::Position;
use crate::models::{DecisionKind, MarketRegime, RiskLevel, Side, TacticalSignal, Timeframe};
use crate::reports::{PriceZone, ReportBundle};
use crate::strategy::scoring::{score_engagement, EngagementScore};

const FINAL_FRACTION_EPSILON: f64 = 1e-9;

/// A structural level near price, and how far away it sits
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneCandidate {
    pub label: String,
    pub price: f64,
    /// Percentage of current price
    pub distance_pct: f64,
}

impl fmt::Display for ZoneCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:.4} ({:.3}%)", self.label, self.price, self.distance_pct)
    }
}

/// Nearest support below and resistance above the current price
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProximityReport {
    pub price: f64,
    pub nearest_support: Option<ZoneCandidate>,
    pub nearest_resistance: Option<ZoneCandidate>,
}

impl ProximityReport {
    /// Zone a `side` entry would lean on
    pub fn for_side(&self, side: Side) -> Option<&ZoneCandidate> {
        match side {
            Side::Long => self.nearest_support.as_ref(),
            Side::Short => self.nearest_resistance.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostics {
    None,
    Proximity(ProximityReport),
    Engagement(EngagementScore),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: DecisionKind,
    /// Present for every actionable decision
    pub signal: Option<TacticalSignal>,
    pub diagnostics: Diagnostics,
}

impl Evaluation {
    fn passive(decision: DecisionKind, diagnostics: Diagnostics) -> Self {
        Self {
            decision,
            signal: None,
            diagnostics,
        }
    }

    fn act(signal: TacticalSignal, diagnostics: Diagnostics) -> Self {
        Self {
            decision: signal.decision,
            signal: Some(signal),
            diagnostics,
        }
    }
}

/// Stateless per-tick decision maker
pub struct TacticalDecisionEngine {
    config: TacticalConfig,
    tactical_timeframe: Timeframe,
}

impl TacticalDecisionEngine {
    pub fn new(config: &TacticalConfig, tactical_timeframe: Timeframe) -> Self {
        Self {
            config: config.clone(),
            tactical_timeframe,
        }
    }

    pub fn evaluate(&self, bundle: &ReportBundle, position: Option<&Position>) -> Evaluation {
        match position {
            Some(position) => self.manage(position, bundle),
            None => self.seek_entry(bundle),
        }
    }

    fn seek_entry(&self, bundle: &ReportBundle) -> Evaluation {
        let ranked = bundle
            .structure
            .as_ref()
            .and_then(|s| s.ranked_regime(&self.config.regime_timeframes));
        let Some((regime_tf, regime)) = ranked.filter(|(_, r)| *r != MarketRegime::Uncertain) else {
            tracing::debug!("WAIT: no defined regime for {}", bundle.symbol);
            return Evaluation::passive(DecisionKind::Wait, Diagnostics::None);
        };
        let Some(price) = bundle.last_price(self.tactical_timeframe).filter(|p| *p > 0.0) else {
            tracing::debug!("WAIT: no {} price for {}", self.tactical_timeframe, bundle.symbol);
            return Evaluation::passive(DecisionKind::Wait, Diagnostics::None);
        };

        let proximity = self.scan_zones(bundle, price);
        let near = |side: Side| {
            proximity
                .for_side(side)
                .filter(|zone| zone.distance_pct < self.config.aov_proximity_percent)
                .is_some()
        };

        let side = match regime.trend_side() {
            Some(side) => near(side).then_some(side),
            None if regime == MarketRegime::TightRange => {
                [Side::Long, Side::Short].into_iter().find(|side| near(*side))
            }
            None => None,
        };

        let Some(side) = side else {
            tracing::debug!(
                "WAIT: no area of value for {:?} ({}). Support: {}, resistance: {}",
                regime,
                regime_tf,
                describe(proximity.nearest_support.as_ref()),
                describe(proximity.nearest_resistance.as_ref())
            );
            return Evaluation::passive(DecisionKind::Wait, Diagnostics::Proximity(proximity));
        };

        let zone_label = proximity
            .for_side(side)
            .map(|z| z.label.clone())
            .unwrap_or_default();

        let Some(power) = bundle.power else {
            tracing::warn!("WAIT: {:?} zone {} found but no force reading", side, zone_label);
            return Evaluation::passive(DecisionKind::Wait, Diagnostics::Proximity(proximity));
        };
        let force = power.true_net_force;
        let threshold = self.config.min_true_net_force_for_entry;
        let convinced = match side {
            Side::Long => force >= threshold,
            Side::Short => force <= -threshold,
        };
        if !convinced {
            tracing::info!(
                "WAIT: {:?} zone {} found, force {:.2} lacks conviction (threshold {})",
                side,
                zone_label,
                force,
                threshold
            );
            return Evaluation::passive(DecisionKind::Wait, Diagnostics::Proximity(proximity));
        }

        tracing::info!(
            "ADVANCE {:?} on {}: regime {:?} ({}), zone {}, force {:.2}",
            side,
            bundle.symbol,
            regime,
            regime_tf,
            zone_label,
            force
        );
        let signal = TacticalSignal::new(format!("ENTRY:{zone_label}"), DecisionKind::Advance, &bundle.symbol)
            .with_side(side)
            .with_risk_level(RiskLevel::Full);
        Evaluation::act(signal, Diagnostics::Proximity(proximity))
    }

    /// Collect support below and resistance above `price` across the zone timeframes
    pub fn scan_zones(&self, bundle: &ReportBundle, price: f64) -> ProximityReport {
        let mut supports: Vec<(String, f64)> = Vec::new();
        let mut resistances: Vec<(String, f64)> = Vec::new();

        for &tf in &self.config.zone_timeframes {
            let zone_maps = [("OB", &bundle.order_blocks), ("FVG", &bundle.fair_value_gaps)];
            for (tag, map) in zone_maps {
                let buckets = map.get(tf);
                supports.extend(
                    buckets
                        .bullish
                        .iter()
                        .filter(|z| z.price_low <= price)
                        .map(|z| (format!("{tf} {tag}"), support_edge(z, price))),
                );
                resistances.extend(
                    buckets
                        .bearish
                        .iter()
                        .filter(|z| z.price_high >= price)
                        .map(|z| (format!("{tf} {tag}"), resistance_edge(z, price))),
                );
            }

            if let Some(structure) = &bundle.structure {
                supports.extend(
                    structure
                        .swing_levels(Side::Long, tf)
                        .filter(|level| *level <= price)
                        .map(|level| (format!("{tf} swing low"), level)),
                );
                resistances.extend(
                    structure
                        .swing_levels(Side::Short, tf)
                        .filter(|level| *level >= price)
                        .map(|level| (format!("{tf} swing high"), level)),
                );
            }
        }

        if let Some(structure) = &bundle.structure {
            if let Some(low) = structure.range_low.filter(|l| *l <= price) {
                supports.push(("range low".to_string(), low));
            }
            if let Some(high) = structure.range_high.filter(|h| *h >= price) {
                resistances.push(("range high".to_string(), high));
            }
        }

        let candidate = |(label, level): (String, f64)| ZoneCandidate {
            label,
            price: level,
            distance_pct: (price - level).abs() / price * 100.0,
        };

        ProximityReport {
            price,
            nearest_support: supports
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(candidate),
            nearest_resistance: resistances
                .into_iter()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(candidate),
        }
    }

    fn manage(&self, position: &Position, bundle: &ReportBundle) -> Evaluation {
        let score = score_engagement(position.side, bundle, &self.config.weights);
        let signal = |source: &str, decision: DecisionKind| {
            TacticalSignal::new(source, decision, &position.symbol).for_position(position.id)
        };

        if score.threat >= self.config.catastrophic_threat_threshold {
            tracing::error!(
                "Catastrophic threat {:.2} against {}: RETREAT. Reasons: {:?}",
                score.threat,
                position.id,
                score.reasons
            );
            let retreat = signal("MANAGEMENT:CATASTROPHIC_THREAT", DecisionKind::Retreat);
            return Evaluation::act(retreat, Diagnostics::Engagement(score));
        }

        if score.threat >= self.config.proactive_threat_threshold {
            tracing::warn!(
                "Proactive defense: threat {:.2} against {}. Reasons: {:?}",
                score.threat,
                position.id,
                score.reasons
            );
            let exit = signal("MANAGEMENT:PROACTIVE_DEFENSE", DecisionKind::PartialExit)
                .with_exit_ratio(self.config.proactive_exit_ratio);
            return Evaluation::act(exit, Diagnostics::Engagement(score));
        }

        if let (Some(price), Some((index, target))) =
            (bundle.last_price(self.tactical_timeframe), position.next_target())
        {
            let reached = match position.side {
                Side::Long => price >= target.price,
                Side::Short => price <= target.price,
            };
            if reached {
                let before = position.fraction_taken_before(index);
                let source = format!("MANAGEMENT:TP_{}_HIT", index + 1);
                tracing::info!(
                    "Target #{} reached for {} @ {:.4} (target {:.4})",
                    index + 1,
                    position.id,
                    price,
                    target.price
                );

                let exit = if before + target.exit_fraction >= 1.0 - FINAL_FRACTION_EPSILON {
                    signal(source.as_str(), DecisionKind::Retreat).with_target(index)
                } else {
                    signal(source.as_str(), DecisionKind::PartialExit)
                        .with_exit_ratio(target.exit_fraction / (1.0 - before))
                        .with_target(index)
                };
                return Evaluation::act(exit, Diagnostics::Engagement(score));
            }
        }

        tracing::debug!(
            "HOLD {}: opportunity {:.2}, threat {:.2}",
            position.id,
            score.opportunity,
            score.threat
        );
        Evaluation::passive(DecisionKind::Hold, Diagnostics::Engagement(score))
    }
}

/// Upper edge of a support zone, clamped to price when price sits inside it
fn support_edge(zone: &PriceZone, price: f64) -> f64 {
    zone.price_high.min(price)
}

fn resistance_edge(zone: &PriceZone, price: f64) -> f64 {
    zone.price_low.max(price)
}

fn describe(zone: Option<&ZoneCandidate>) -> String {
    zone.map(ZoneCandidate::to_string)
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TacticalConfig;
    use crate::execution::{PositionStatus, Position};
    use crate::models::Candle;
    use crate::reports::{ConfirmationSignal, PowerReading, StructureReport};
    use crate::risk::ProfitTarget;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use uuid::Uuid;

    fn engine() -> TacticalDecisionEngine {
        TacticalDecisionEngine::new(&TacticalConfig::default(), Timeframe::M5)
    }

    fn bundle(price: f64, regime: MarketRegime, force: f64) -> ReportBundle {
        let now = Utc::now();
        let mut bundle = ReportBundle::new("BTC/USDT", now);
        bundle.ohlcv.set(
            Timeframe::M5,
            vec![Candle {
                timestamp: now,
                open: price,
                high: price + 0.5,
                low: price - 0.5,
                close: price,
                volume: 10.0,
            }],
        );
        let mut structure = StructureReport::default();
        structure.regimes.set(Timeframe::H1, Some(regime));
        bundle.structure = Some(structure);
        bundle.power = Some(PowerReading {
            true_net_force: force,
            absorption: false,
        });
        bundle
    }

    fn with_bullish_block(mut bundle: ReportBundle, low: f64, high: f64) -> ReportBundle {
        bundle
            .order_blocks
            .get_mut(Timeframe::H1)
            .bullish
            .push(PriceZone::new(low, high));
        bundle
    }

    fn long_position(targets: Vec<ProfitTarget>) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            size: 10.0,
            leverage: 1.0,
            protective_stop: 96.0,
            catastrophic_stop: 94.0,
            targets,
            tps_hit: 0,
            flip_count: 0,
            hedge_trap: None,
            status: PositionStatus::Open,
            strategic_intent: MarketRegime::BullTrend,
            entry_time: Utc::now(),
            entry_order_id: "sim-1".to_string(),
            flipped_from: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    fn threats(bundle: &mut ReportBundle, confidence: f64) {
        bundle.signals.order_block.set(
            Timeframe::M5,
            vec![ConfirmationSignal {
                bias: Side::Short,
                confidence,
                label: "BEARISH_REJECTION".to_string(),
            }],
        );
    }

    #[test]
    fn test_advance_long_at_trend_support_with_force() {
        let bundle = with_bullish_block(bundle(100.0, MarketRegime::BullTrend, 20.0), 99.5, 99.8);

        let evaluation = engine().evaluate(&bundle, None);

        assert_eq!(evaluation.decision, DecisionKind::Advance);
        let signal = evaluation.signal.unwrap();
        assert_eq!(signal.side, Some(Side::Long));
        assert_eq!(signal.risk_level, RiskLevel::Full);
    }

    #[test]
    fn test_weak_force_in_zone_waits() {
        let bundle = with_bullish_block(bundle(100.0, MarketRegime::BullTrend, 10.0), 99.5, 99.8);

        let evaluation = engine().evaluate(&bundle, None);

        assert_eq!(evaluation.decision, DecisionKind::Wait);
        assert!(evaluation.signal.is_none());
    }

    #[test]
    fn test_force_must_match_zone_direction() {
        let bundle = with_bullish_block(bundle(100.0, MarketRegime::BullTrend, -50.0), 99.5, 99.8);
        assert_eq!(engine().evaluate(&bundle, None).decision, DecisionKind::Wait);
    }

    #[test]
    fn test_zone_exactly_at_proximity_limit_waits() {
        let bundle = with_bullish_block(bundle(100.0, MarketRegime::BullTrend, 20.0), 99.0, 99.5);
        let mut config = TacticalConfig::default();
        config.aov_proximity_percent = (100.0_f64 - 99.5).abs() / 100.0 * 100.0;

        let at_limit = TacticalDecisionEngine::new(&config, Timeframe::M5);
        assert_eq!(at_limit.evaluate(&bundle, None).decision, DecisionKind::Wait);

        config.aov_proximity_percent += 1e-6;
        let inside = TacticalDecisionEngine::new(&config, Timeframe::M5);
        assert_eq!(inside.evaluate(&bundle, None).decision, DecisionKind::Advance);
    }

    #[test]
    fn test_wait_reports_nearest_zones() {
        let mut bundle = with_bullish_block(bundle(100.0, MarketRegime::BullTrend, 50.0), 97.0, 98.0);
        bundle
            .fair_value_gaps
            .get_mut(Timeframe::M15)
            .bearish
            .push(PriceZone::new(103.0, 104.0));

        let evaluation = engine().evaluate(&bundle, None);

        assert_eq!(evaluation.decision, DecisionKind::Wait);
        let Diagnostics::Proximity(report) = evaluation.diagnostics else {
            panic!("expected proximity diagnostics");
        };
        let support = report.nearest_support.unwrap();
        assert_eq!(support.label, "1h OB");
        assert_relative_eq!(support.distance_pct, 2.0, epsilon = 1e-9);
        let resistance = report.nearest_resistance.unwrap();
        assert_eq!(resistance.label, "15m FVG");
        assert_relative_eq!(resistance.distance_pct, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_undefined_regime_waits() {
        let bundle = with_bullish_block(bundle(100.0, MarketRegime::Uncertain, 50.0), 99.5, 99.8);
        let evaluation = engine().evaluate(&bundle, None);

        assert_eq!(evaluation.decision, DecisionKind::Wait);
        assert_eq!(evaluation.diagnostics, Diagnostics::None);
    }

    #[test]
    fn test_range_takes_short_at_upper_boundary() {
        let mut bundle = bundle(100.0, MarketRegime::TightRange, -30.0);
        if let Some(structure) = bundle.structure.as_mut() {
            structure.range_high = Some(100.3);
            structure.range_low = Some(95.0);
        }

        let evaluation = engine().evaluate(&bundle, None);

        assert_eq!(evaluation.decision, DecisionKind::Advance);
        assert_eq!(evaluation.signal.unwrap().side, Some(Side::Short));
    }

    #[test]
    fn test_catastrophic_threat_retreats_before_targets() {
        let position = long_position(vec![ProfitTarget { price: 105.0, exit_fraction: 1.0 }]);
        let mut bundle = bundle(106.0, MarketRegime::BullTrend, 0.0);
        // 0.9 x 1.0 x 5m weight 1.0 = 0.9, five of them = 4.5
        bundle.signals.fibonacci.set(
            Timeframe::M5,
            vec![
                ConfirmationSignal {
                    bias: Side::Short,
                    confidence: 0.9,
                    label: String::new(),
                };
                5
            ],
        );

        let evaluation = engine().evaluate(&bundle, Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::Retreat);
        let signal = evaluation.signal.unwrap();
        assert_eq!(signal.position_id, Some(position.id));
        assert!(signal.target_index.is_none());
    }

    #[test]
    fn test_proactive_threat_takes_partial_exit() {
        let position = long_position(vec![]);
        let mut bundle = bundle(100.0, MarketRegime::BullTrend, 0.0);
        threats(&mut bundle, 3.0);

        let evaluation = engine().evaluate(&bundle, Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::PartialExit);
        assert_eq!(evaluation.signal.unwrap().exit_ratio, Some(0.5));
    }

    #[test]
    fn test_non_final_target_emits_partial_exit() {
        let position = long_position(vec![ProfitTarget { price: 110.0, exit_fraction: 0.5 }]);

        let evaluation = engine().evaluate(&bundle(110.0, MarketRegime::BullTrend, 0.0), Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::PartialExit);
        let signal = evaluation.signal.unwrap();
        assert_eq!(signal.exit_ratio, Some(0.5));
        assert_eq!(signal.target_index, Some(0));
    }

    #[test]
    fn test_final_target_retreats() {
        let mut position = long_position(vec![
            ProfitTarget { price: 105.0, exit_fraction: 0.5 },
            ProfitTarget { price: 110.0, exit_fraction: 0.5 },
        ]);
        position.tps_hit = 1;

        let evaluation = engine().evaluate(&bundle(111.0, MarketRegime::BullTrend, 0.0), Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::Retreat);
        assert_eq!(evaluation.signal.unwrap().target_index, Some(1));
    }

    #[test]
    fn test_second_of_three_targets_scales_ratio_to_remaining() {
        let mut position = long_position(vec![
            ProfitTarget { price: 105.0, exit_fraction: 0.4 },
            ProfitTarget { price: 110.0, exit_fraction: 0.3 },
            ProfitTarget { price: 120.0, exit_fraction: 0.3 },
        ]);
        position.tps_hit = 1;

        let evaluation = engine().evaluate(&bundle(110.0, MarketRegime::BullTrend, 0.0), Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::PartialExit);
        assert_relative_eq!(evaluation.signal.unwrap().exit_ratio.unwrap(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_quiet_engaged_tick_holds() {
        let position = long_position(vec![ProfitTarget { price: 110.0, exit_fraction: 1.0 }]);
        let evaluation = engine().evaluate(&bundle(104.0, MarketRegime::BullTrend, 0.0), Some(&position));

        assert_eq!(evaluation.decision, DecisionKind::Hold);
        assert!(evaluation.signal.is_none());
    }
}
