use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod timeframe;

pub use timeframe::{Timeframe, TimeframeMap};

/// Direction of an exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn is_long(self) -> bool {
        self == Side::Long
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Structural regime classification produced by the structure analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    BullTrend,
    BullTrendPullback,
    BearTrend,
    BearTrendPullback,
    TightRange,
    Uncertain,
}

impl MarketRegime {
    /// Directional-trend regimes. Only positions born in one of these may flip automatically.
    pub fn is_trend(self) -> bool {
        matches!(self, MarketRegime::BullTrend | MarketRegime::BearTrend)
    }

    /// Side a trend-continuation entry favors, if any
    pub fn trend_side(self) -> Option<Side> {
        match self {
            MarketRegime::BullTrend | MarketRegime::BullTrendPullback => Some(Side::Long),
            MarketRegime::BearTrend | MarketRegime::BearTrendPullback => Some(Side::Short),
            MarketRegime::TightRange | MarketRegime::Uncertain => None,
        }
    }
}

/// Engagement size requested from the capital ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Full,
    Half,
    Scout,
}

/// What the tactical layer wants done on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Advance,
    Wait,
    Hold,
    ScaleIn,
    PartialExit,
    Retreat,
    Flip,
}

/// A decision plus the parameters the position ledger needs to carry it out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticalSignal {
    pub source: String,
    pub decision: DecisionKind,
    pub symbol: String,
    pub side: Option<Side>,
    pub risk_level: RiskLevel,
    pub strategic_multiplier: f64,
    pub confidence: f64,
    /// Set when the signal manages an existing position
    pub position_id: Option<Uuid>,
    pub exit_ratio: Option<f64>,
    pub scale_in_ratio: Option<f64>,
    /// Index of the staged target that produced this exit
    pub target_index: Option<usize>,
}

impl TacticalSignal {
    pub fn new(source: impl Into<String>, decision: DecisionKind, symbol: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            decision,
            symbol: symbol.into(),
            side: None,
            risk_level: RiskLevel::Full,
            strategic_multiplier: 1.0,
            confidence: 1.0,
            position_id: None,
            exit_ratio: None,
            scale_in_ratio: None,
            target_index: None,
        }
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn for_position(mut self, position_id: Uuid) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn with_exit_ratio(mut self, ratio: f64) -> Self {
        self.exit_ratio = Some(ratio);
        self
    }

    pub fn with_scale_in_ratio(mut self, ratio: f64) -> Self {
        self.scale_in_ratio = Some(ratio);
        self
    }

    pub fn with_target(mut self, index: usize) -> Self {
        self.target_index = Some(index);
        self
    }
}
