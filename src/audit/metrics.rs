use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{EventReceiver, PositionClosed};
use crate::execution::ExitReason;
use crate::models::{MarketRegime, Side};

/// Record of a single closed position for analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub holding_period_minutes: i64,
    pub strategic_intent: MarketRegime,
    pub exit_reason: ExitReason,
    pub flip_count: u32,
}

impl From<&PositionClosed> for TradeRecord {
    fn from(event: &PositionClosed) -> Self {
        Self {
            position_id: event.position_id,
            side: event.side,
            entry_time: event.entry_time,
            exit_time: event.exit_time,
            entry_price: event.entry_price,
            exit_price: event.exit_price,
            pnl: event.realized_pnl,
            pnl_pct: event.pnl_pct,
            holding_period_minutes: event.holding_minutes(),
            strategic_intent: event.strategic_intent,
            exit_reason: event.exit_reason,
            flip_count: event.flip_count,
        }
    }
}

/// Results grouped by the regime a position was born in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentBreakdown {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    // P&L
    pub total_pnl: f64,
    pub total_return_pct: f64,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    // P&L distribution
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Total wins / total losses
    pub profit_factor: f64,

    // Risk
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,

    pub avg_holding_period_minutes: f64,
    pub by_intent: BTreeMap<String, IntentBreakdown>,
}

/// Listens for closed positions and keeps run statistics
#[derive(Debug, Clone)]
pub struct PerformanceAuditor {
    initial_capital: f64,
    trades: Vec<TradeRecord>,
}

impl PerformanceAuditor {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            trades: Vec::new(),
        }
    }

    pub fn record(&mut self, event: &PositionClosed) {
        tracing::debug!(
            "Audit: {} {:?} closed ({:?}), PnL ${:.2}",
            event.position_id,
            event.side,
            event.exit_reason,
            event.realized_pnl
        );
        self.trades.push(TradeRecord::from(event));
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Drain `events` until every sender is dropped
    pub async fn run(mut self, mut events: EventReceiver) -> Self {
        while let Some(event) = events.recv().await {
            self.record(&event);
        }
        tracing::debug!("Audit stream closed after {} trades", self.trades.len());
        self
    }

    pub fn summary(&self) -> PerformanceSummary {
        let total_trades = self.trades.len();
        if total_trades == 0 {
            return PerformanceSummary::default();
        }

        let total_pnl: f64 = self.trades.iter().map(|t| t.pnl).sum();
        let total_return_pct = if self.initial_capital > 0.0 {
            total_pnl / self.initial_capital * 100.0
        } else {
            0.0
        };

        // Win/Loss statistics
        let winning: Vec<f64> = self.trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losing: Vec<f64> = self.trades.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();

        let total_wins: f64 = winning.iter().sum();
        let total_losses: f64 = losing.iter().map(|p| p.abs()).sum();

        let avg_win = mean(&winning);
        let avg_loss = if losing.is_empty() {
            0.0
        } else {
            total_losses / losing.len() as f64
        };

        let largest_win = winning.iter().copied().fold(0.0, f64::max);
        let largest_loss = losing.iter().copied().fold(0.0, f64::min);

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) = self.calculate_drawdown();

        let avg_holding_period_minutes = self
            .trades
            .iter()
            .map(|t| t.holding_period_minutes as f64)
            .sum::<f64>()
            / total_trades as f64;

        let mut by_intent: BTreeMap<String, IntentBreakdown> = BTreeMap::new();
        for trade in &self.trades {
            let entry = by_intent
                .entry(format!("{:?}", trade.strategic_intent))
                .or_default();
            entry.trades += 1;
            entry.total_pnl += trade.pnl;
            if trade.pnl > 0.0 {
                entry.wins += 1;
            }
        }
        for breakdown in by_intent.values_mut() {
            breakdown.win_rate = breakdown.wins as f64 / breakdown.trades as f64 * 100.0;
        }

        PerformanceSummary {
            total_pnl,
            total_return_pct,
            total_trades,
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            win_rate: winning.len() as f64 / total_trades as f64 * 100.0,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            avg_holding_period_minutes,
            by_intent,
        }
    }

    /// Peak-to-trough equity decline over the closed trades, in order
    fn calculate_drawdown(&self) -> (f64, f64) {
        let mut peak = self.initial_capital;
        let mut equity = self.initial_capital;
        let mut max_dd: f64 = 0.0;
        let mut max_dd_pct: f64 = 0.0;

        for trade in &self.trades {
            equity += trade.pnl;
            peak = peak.max(equity);

            let drawdown = peak - equity;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }
}

impl PerformanceSummary {
    pub fn log_report(&self) {
        tracing::info!(
            "Performance: {} trades, {} wins / {} losses ({:.1}%), PnL ${:.2} ({:+.2}%)",
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.win_rate,
            self.total_pnl,
            self.total_return_pct
        );
        if self.total_trades == 0 {
            return;
        }
        tracing::info!(
            "Avg win ${:.2}, avg loss ${:.2}, largest win ${:.2}, largest loss ${:.2}, profit factor {:.2}",
            self.avg_win,
            self.avg_loss,
            self.largest_win,
            self.largest_loss,
            self.profit_factor
        );
        tracing::info!(
            "Max drawdown ${:.2} ({:.2}%), avg holding {:.1} min",
            self.max_drawdown,
            self.max_drawdown_pct,
            self.avg_holding_period_minutes
        );
        for (intent, breakdown) in &self.by_intent {
            tracing::info!(
                "  {}: {} trades, PnL ${:.2}, win rate {:.1}%",
                intent,
                breakdown.trades,
                breakdown.total_pnl,
                breakdown.win_rate
            );
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
