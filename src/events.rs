// Outbound notifications from the position ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::execution::{ExitReason, Position};
use crate::models::{MarketRegime, Side};

/// Snapshot emitted once per full close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// Size still open at the final leg
    pub closed_size: f64,
    /// Every partial plus the final leg
    pub realized_pnl: f64,
    pub pnl_pct: f64,
    pub strategic_intent: MarketRegime,
    pub flip_count: u32,
    pub exit_reason: ExitReason,
}

impl PositionClosed {
    pub fn from_position(position: &Position) -> Option<Self> {
        let (Some(exit_price), Some(exit_time), Some(exit_reason)) =
            (position.exit_price, position.exit_time, position.exit_reason)
        else {
            return None;
        };

        Some(Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time,
            closed_size: position.size,
            realized_pnl: position.realized_pnl,
            pnl_pct: position.pnl_pct_at(exit_price),
            strategic_intent: position.strategic_intent,
            flip_count: position.flip_count,
            exit_reason,
        })
    }

    pub fn holding_minutes(&self) -> i64 {
        (self.exit_time - self.entry_time).num_minutes()
    }
}

pub type EventSender = mpsc::UnboundedSender<PositionClosed>;
pub type EventReceiver = mpsc::UnboundedReceiver<PositionClosed>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
