use std::collections::BTreeSet;

use crate::config::ScoringWeights;
use crate::models::{Side, Timeframe};
use crate::reports::{ReportBundle, SignalSource};

/// Weighted agreement and disagreement with a held position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngagementScore {
    pub opportunity: f64,
    pub threat: f64,
    pub reasons: Vec<String>,
}

impl ScoringWeights {
    pub fn for_source(&self, source: SignalSource) -> f64 {
        match source {
            SignalSource::OrderBlock => self.order_block,
            SignalSource::FairValueGap => self.fair_value_gap,
            SignalSource::Fibonacci => self.fibonacci,
            SignalSource::Divergence => self.divergence,
        }
    }

    pub fn for_timeframe(&self, timeframe: Timeframe) -> f64 {
        *self.timeframes.get(timeframe)
    }
}

/// Score every confirmation signal and directional structure event against the
/// held side.
///
/// Each contribution is `confidence x source weight x timeframe weight`. Signals
/// leaning with `held` add to opportunity, everything else to threat. Swing
/// points carry no bias and are not scored.
pub fn score_engagement(held: Side, bundle: &ReportBundle, weights: &ScoringWeights) -> EngagementScore {
    let mut opportunity = 0.0;
    let mut threat = 0.0;
    let mut reasons = BTreeSet::new();

    let mut tally = |bias: Side, score: f64, what: String| {
        if bias == held {
            opportunity += score;
            reasons.insert(format!("OPP-{what}"));
        } else {
            threat += score;
            reasons.insert(format!("THREAT-{what}"));
        }
    };

    for (source, book) in bundle.signals.sources() {
        let base = weights.for_source(source);
        for (tf, signals) in book.iter() {
            let tf_weight = weights.for_timeframe(tf);
            for signal in signals {
                let what = if signal.label.is_empty() {
                    format!("{}@{}", source.tag(), tf)
                } else {
                    format!("{}_{}@{}", source.tag(), signal.label, tf)
                };
                tally(signal.bias, signal.confidence * base * tf_weight, what);
            }
        }
    }

    if let Some(structure) = &bundle.structure {
        for (tf, events) in structure.narrative.iter() {
            let tf_weight = weights.for_timeframe(tf);
            for event in events {
                let Some(bias) = event.kind.bias() else {
                    continue;
                };
                tally(
                    bias,
                    event.confidence * weights.structure_break * tf_weight,
                    format!("{}@{}", event.kind.label(), tf),
                );
            }
        }
    }

    EngagementScore {
        opportunity,
        threat,
        reasons: reasons.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::{ConfirmationSignal, StructuralEvent, StructuralEventKind, StructureReport};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn signal(bias: Side, confidence: f64) -> ConfirmationSignal {
        ConfirmationSignal {
            bias,
            confidence,
            label: String::new(),
        }
    }

    #[test]
    fn test_empty_bundle_scores_zero() {
        let bundle = ReportBundle::new("BTC/USDT", Utc::now());
        let score = score_engagement(Side::Long, &bundle, &ScoringWeights::default());
        assert_eq!(score, EngagementScore::default());
    }

    #[test]
    fn test_signals_weighted_by_source_and_timeframe() {
        let mut bundle = ReportBundle::new("BTC/USDT", Utc::now());
        bundle.signals.order_block.set(Timeframe::H4, vec![signal(Side::Short, 0.8)]);
        bundle.signals.divergence.set(Timeframe::M5, vec![signal(Side::Long, 0.5)]);

        let score = score_engagement(Side::Long, &bundle, &ScoringWeights::default());

        assert_relative_eq!(score.threat, 0.8 * 1.0 * 2.0);
        assert_relative_eq!(score.opportunity, 0.5 * 1.0 * 1.0);
        assert!(score.reasons.contains(&"THREAT-OB@4h".to_string()));
        assert!(score.reasons.contains(&"OPP-DIV@5m".to_string()));
    }

    #[test]
    fn test_structure_breaks_use_break_weight_and_skip_swings() {
        let mut structure = StructureReport::default();
        structure.narrative.set(
            Timeframe::H1,
            vec![
                StructuralEvent {
                    kind: StructuralEventKind::BearishChoch,
                    price_level: 99.0,
                    confidence: 1.0,
                },
                StructuralEvent {
                    kind: StructuralEventKind::SwingHigh,
                    price_level: 104.0,
                    confidence: 1.0,
                },
            ],
        );
        let mut bundle = ReportBundle::new("BTC/USDT", Utc::now());
        bundle.structure = Some(structure);

        let long = score_engagement(Side::Long, &bundle, &ScoringWeights::default());
        let short = score_engagement(Side::Short, &bundle, &ScoringWeights::default());

        assert_relative_eq!(long.threat, 1.5 * 1.5);
        assert_relative_eq!(short.opportunity, 1.5 * 1.5);
        assert_eq!(short.threat, 0.0);
    }
}
