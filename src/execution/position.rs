use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MarketRegime, Side};
use crate::risk::ProfitTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrapStatus {
    Armed,
    Cancelled,
    Triggered,
}

/// Pending conditional reverse order at the catastrophic stop.
///
/// Owned by its position; the gateway reports the parent id when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeTrap {
    pub order_id: String,
    pub trigger_price: f64,
    pub size: f64,
    pub side: Side,
    pub status: TrapStatus,
}

impl HedgeTrap {
    pub fn is_armed(&self) -> bool {
        self.status == TrapStatus::Armed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Retreat,
    FinalTarget,
    /// Closed as the first leg of a flip
    Flip,
    /// Trap fired on a position that may not flip
    ForcedRetreat,
    Manual,
    ResidualBelowMinimum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    /// Weighted average across scale-ins
    pub entry_price: f64,
    pub size: f64,
    pub leverage: f64,
    pub protective_stop: f64,
    pub catastrophic_stop: f64,
    pub targets: Vec<ProfitTarget>,
    pub tps_hit: usize,
    pub flip_count: u32,
    pub hedge_trap: Option<HedgeTrap>,
    pub status: PositionStatus,
    /// Regime on the tactical timeframe when the position was born
    pub strategic_intent: MarketRegime,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: String,
    /// Position this one was flipped from
    pub flipped_from: Option<Uuid>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// Linear PnL of `size` units closed at `price`
    pub fn pnl_at(&self, price: f64, size: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * size * self.leverage
    }

    /// Leveraged percentage move from entry
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price / self.entry_price - 1.0) * self.leverage * 100.0
    }

    pub fn update_unrealized(&mut self, price: f64) {
        self.unrealized_pnl = self.pnl_at(price, self.size);
        self.unrealized_pnl_pct = self.pnl_pct_at(price);
    }

    pub fn armed_trap(&self) -> Option<&HedgeTrap> {
        self.hedge_trap.as_ref().filter(|t| t.is_armed())
    }

    /// Next staged target not yet hit
    pub fn next_target(&self) -> Option<(usize, &ProfitTarget)> {
        self.targets.get(self.tps_hit).map(|t| (self.tps_hit, t))
    }

    /// Sum of exit fractions for targets before `index`
    pub fn fraction_taken_before(&self, index: usize) -> f64 {
        self.targets.iter().take(index).map(|t| t.exit_fraction).sum()
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn position(side: Side) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC/USDT".to_string(),
            side,
            entry_price: 100.0,
            size: 10.0,
            leverage: 1.0,
            protective_stop: 96.0,
            catastrophic_stop: 94.0,
            targets: vec![
                ProfitTarget { price: 105.0, exit_fraction: 0.5 },
                ProfitTarget { price: 110.0, exit_fraction: 0.5 },
            ],
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

    #[test]
    fn test_linear_pnl_both_sides() {
        let long = position(Side::Long);
        let short = position(Side::Short);

        assert_relative_eq!(long.pnl_at(110.0, 5.0), 50.0);
        assert_relative_eq!(short.pnl_at(110.0, 5.0), -50.0);
        assert_relative_eq!(short.pnl_at(90.0, 10.0), 100.0);
    }

    #[test]
    fn test_unrealized_uses_leverage() {
        let mut long = position(Side::Long);
        long.leverage = 3.0;
        long.update_unrealized(102.0);

        assert_relative_eq!(long.unrealized_pnl, 60.0);
        assert_relative_eq!(long.unrealized_pnl_pct, 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_next_target_advances_with_hits() {
        let mut long = position(Side::Long);
        assert_eq!(long.next_target().map(|(i, _)| i), Some(0));

        long.tps_hit = 1;
        let (index, target) = long.next_target().unwrap();
        assert_eq!(index, 1);
        assert_eq!(target.price, 110.0);
        assert_relative_eq!(long.fraction_taken_before(1), 0.5);

        long.tps_hit = 2;
        assert!(long.next_target().is_none());
    }

    #[test]
    fn test_only_armed_trap_is_reported() {
        let mut long = position(Side::Long);
        long.hedge_trap = Some(HedgeTrap {
            order_id: "sim-trap".to_string(),
            trigger_price: 94.0,
            size: 15.0,
            side: Side::Short,
            status: TrapStatus::Cancelled,
        });
        assert!(long.armed_trap().is_none());

        long.hedge_trap.as_mut().unwrap().status = TrapStatus::Armed;
        assert!(long.armed_trap().is_some());
    }
}
