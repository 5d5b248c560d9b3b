// Report bundle produced each tick by the external analyzers.
//
// Everything here is consumed, never computed, by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Candle, MarketRegime, Side, Timeframe, TimeframeMap};

/// A price band: order block or fair-value gap
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceZone {
    pub price_high: f64,
    pub price_low: f64,
}

impl PriceZone {
    pub fn new(price_low: f64, price_high: f64) -> Self {
        Self {
            price_high,
            price_low,
        }
    }
}

/// Bullish/bearish split used by both the order-block map and the unfilled-gap map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideBuckets<T> {
    pub bullish: Vec<T>,
    pub bearish: Vec<T>,
}

impl<T> Default for SideBuckets<T> {
    fn default() -> Self {
        Self {
            bullish: Vec::new(),
            bearish: Vec::new(),
        }
    }
}

impl<T> SideBuckets<T> {
    /// Bullish entries back a long, bearish entries back a short
    pub fn for_side(&self, side: Side) -> &[T] {
        match side {
            Side::Long => &self.bullish,
            Side::Short => &self.bearish,
        }
    }
}

pub type ZoneMap = TimeframeMap<SideBuckets<PriceZone>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StructuralEventKind {
    SwingHigh,
    SwingLow,
    BullishBos,
    BearishBos,
    BullishChoch,
    BearishChoch,
}

impl StructuralEventKind {
    /// Breaks of structure and changes of character lean one way; swing points are neutral
    pub fn bias(self) -> Option<Side> {
        match self {
            StructuralEventKind::BullishBos | StructuralEventKind::BullishChoch => Some(Side::Long),
            StructuralEventKind::BearishBos | StructuralEventKind::BearishChoch => Some(Side::Short),
            StructuralEventKind::SwingHigh | StructuralEventKind::SwingLow => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StructuralEventKind::SwingHigh => "SWING_HIGH",
            StructuralEventKind::SwingLow => "SWING_LOW",
            StructuralEventKind::BullishBos => "BULLISH_BOS",
            StructuralEventKind::BearishBos => "BEARISH_BOS",
            StructuralEventKind::BullishChoch => "BULLISH_CHOCH",
            StructuralEventKind::BearishChoch => "BEARISH_CHOCH",
        }
    }
}

fn full_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructuralEvent {
    pub kind: StructuralEventKind,
    pub price_level: f64,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureReport {
    pub regimes: TimeframeMap<Option<MarketRegime>>,
    pub narrative: TimeframeMap<Vec<StructuralEvent>>,
    pub range_high: Option<f64>,
    pub range_low: Option<f64>,
}

impl StructureReport {
    /// First classified regime in rank order
    pub fn ranked_regime(&self, ranked: &[Timeframe]) -> Option<(Timeframe, MarketRegime)> {
        ranked
            .iter()
            .find_map(|&tf| (*self.regimes.get(tf)).map(|regime| (tf, regime)))
    }

    /// Swing lows back a long's stop, swing highs a short's
    pub fn swing_levels(&self, side: Side, timeframe: Timeframe) -> impl Iterator<Item = f64> + '_ {
        let wanted = match side {
            Side::Long => StructuralEventKind::SwingLow,
            Side::Short => StructuralEventKind::SwingHigh,
        };
        self.narrative
            .get(timeframe)
            .iter()
            .filter(move |event| event.kind == wanted)
            .map(|event| event.price_level)
    }
}

/// A confirmation emitted by one of the pattern analyzers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationSignal {
    pub bias: Side,
    pub confidence: f64,
    #[serde(default)]
    pub label: String,
}

/// Short-term buy/sell conviction, independent of structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub true_net_force: f64,
    #[serde(default)]
    pub absorption: bool,
}

/// Families of confirmation signals scored while a position is engaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    OrderBlock,
    FairValueGap,
    Fibonacci,
    Divergence,
}

impl SignalSource {
    pub fn tag(self) -> &'static str {
        match self {
            SignalSource::OrderBlock => "OB",
            SignalSource::FairValueGap => "FVG",
            SignalSource::Fibonacci => "FIB",
            SignalSource::Divergence => "DIV",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBook {
    pub order_block: TimeframeMap<Vec<ConfirmationSignal>>,
    pub fair_value_gap: TimeframeMap<Vec<ConfirmationSignal>>,
    pub fibonacci: TimeframeMap<Vec<ConfirmationSignal>>,
    pub divergence: TimeframeMap<Vec<ConfirmationSignal>>,
}

impl SignalBook {
    pub fn sources(&self) -> [(SignalSource, &TimeframeMap<Vec<ConfirmationSignal>>); 4] {
        [
            (SignalSource::OrderBlock, &self.order_block),
            (SignalSource::FairValueGap, &self.fair_value_gap),
            (SignalSource::Fibonacci, &self.fibonacci),
            (SignalSource::Divergence, &self.divergence),
        ]
    }
}

/// Everything the analyzers know about the market on one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportBundle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub ohlcv: TimeframeMap<Vec<Candle>>,
    pub structure: Option<StructureReport>,
    pub order_blocks: ZoneMap,
    pub fair_value_gaps: ZoneMap,
    pub signals: SignalBook,
    pub power: Option<PowerReading>,
}

impl ReportBundle {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn candles(&self, timeframe: Timeframe) -> &[Candle] {
        self.ohlcv.get(timeframe)
    }

    pub fn last_candle(&self, timeframe: Timeframe) -> Option<&Candle> {
        self.ohlcv.get(timeframe).last()
    }

    pub fn last_price(&self, timeframe: Timeframe) -> Option<f64> {
        self.last_candle(timeframe).map(|c| c.close)
    }

    pub fn regime_at(&self, timeframe: Timeframe) -> Option<MarketRegime> {
        self.structure
            .as_ref()
            .and_then(|s| *s.regimes.get(timeframe))
    }

    /// Directional force, zero when the power scanner reported nothing
    pub fn directional_force(&self) -> f64 {
        self.power.map(|p| p.true_net_force).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_deserializes_with_sparse_fields() {
        let json = r#"{
            "symbol": "BTC/USDT",
            "timestamp": "2024-01-01T00:00:00Z",
            "ohlcv": {"5m": [{"timestamp": "2024-01-01T00:00:00Z", "open": 100.0, "high": 101.0, "low": 99.0, "close": 100.5}]},
            "structure": {"regimes": {"1h": "BULL_TREND"}},
            "order_blocks": {"1h": {"bullish": [{"price_high": 99.0, "price_low": 98.0}]}},
            "power": {"true_net_force": 20.0}
        }"#;

        let bundle: ReportBundle = serde_json::from_str(json).unwrap();
        assert_eq!(bundle.last_price(Timeframe::M5), Some(100.5));
        assert_eq!(bundle.regime_at(Timeframe::H1), Some(MarketRegime::BullTrend));
        assert_eq!(bundle.regime_at(Timeframe::M5), None);
        assert_eq!(bundle.order_blocks.get(Timeframe::H1).bullish.len(), 1);
        assert!(bundle.order_blocks.get(Timeframe::H1).bearish.is_empty());
        assert_eq!(bundle.directional_force(), 20.0);
    }

    #[test]
    fn test_fib_and_divergence_arrive_as_confirmations() {
        // raw zone and pattern lists from the analyzers are ignored
        let json = r#"{
            "symbol": "BTC/USDT",
            "timestamp": "2024-01-01T00:00:00Z",
            "fibonacci_zones": [{"level": 0.618, "price_high": 99.0, "price_low": 98.0, "strength": 0.9}],
            "divergences": [{"pattern_type": "REGULAR_BEARISH", "bias": "SHORT", "strength": 0.7}],
            "signals": {
                "fibonacci": {"15m": [{"bias": "LONG", "confidence": 0.8}]},
                "divergence": {"1h": [{"bias": "SHORT", "confidence": 0.7, "label": "RSI"}]}
            }
        }"#;

        let bundle: ReportBundle = serde_json::from_str(json).unwrap();
        assert_eq!(bundle.signals.fibonacci.get(Timeframe::M15)[0].bias, Side::Long);
        assert_eq!(bundle.signals.divergence.get(Timeframe::H1)[0].label, "RSI");
        assert!(bundle.signals.order_block.get(Timeframe::H1).is_empty());
    }

    #[test]
    fn test_ranked_regime_uses_first_available() {
        let mut structure = StructureReport::default();
        structure.regimes.set(Timeframe::M15, Some(MarketRegime::TightRange));
        structure.regimes.set(Timeframe::M5, Some(MarketRegime::BullTrend));

        let ranked = [Timeframe::H4, Timeframe::H1, Timeframe::M15, Timeframe::M5];
        assert_eq!(
            structure.ranked_regime(&ranked),
            Some((Timeframe::M15, MarketRegime::TightRange))
        );
    }

    #[test]
    fn test_swing_levels_by_side() {
        let mut structure = StructureReport::default();
        structure.narrative.set(
            Timeframe::H1,
            vec![
                StructuralEvent { kind: StructuralEventKind::SwingLow, price_level: 95.0, confidence: 1.0 },
                StructuralEvent { kind: StructuralEventKind::SwingHigh, price_level: 110.0, confidence: 1.0 },
                StructuralEvent { kind: StructuralEventKind::BullishBos, price_level: 104.0, confidence: 0.8 },
            ],
        );

        let lows: Vec<f64> = structure.swing_levels(Side::Long, Timeframe::H1).collect();
        let highs: Vec<f64> = structure.swing_levels(Side::Short, Timeframe::H1).collect();
        assert_eq!(lows, vec![95.0]);
        assert_eq!(highs, vec![110.0]);
    }

    #[test]
    fn test_missing_power_reads_as_zero_force() {
        let bundle = ReportBundle::new("ETH/USDT", Utc::now());
        assert_eq!(bundle.directional_force(), 0.0);
    }
}
