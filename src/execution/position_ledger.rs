use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{EngineConfig, ExecutionConfig};
use crate::error::EngineError;
use crate::events::{EventSender, PositionClosed};
use crate::execution::gateway::{
    FillResult, GatewayError, GatewayResult, OrderGateway, OrderRequest, TriggeredFill,
};
use crate::execution::position::{ExitReason, HedgeTrap, Position, PositionStatus, TrapStatus};
use crate::models::{DecisionKind, MarketRegime, RiskLevel, Side, TacticalSignal, Timeframe};
use crate::reports::ReportBundle;
use crate::risk::{AllocationRequest, CapitalLedger, PerimeterArchitect};
use crate::Result;

/// What a dispatched decision did
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Idle,
    /// Signal addressed a position that is not the active one
    Ignored,
    Opened(Uuid),
    ScaledIn(Uuid),
    PartiallyExited(Uuid),
    Closed(PositionClosed),
    Flipped { closed: Uuid, opened: Option<Uuid> },
}

/// How a fired hedge trap was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Flipped { closed: Uuid, opened: Option<Uuid> },
    Retreated(Uuid),
    /// No active position matched the fill's parent id
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseLeg {
    /// Submit a closing order
    Order,
    /// A reverse fill already offset the position
    Offset,
}

/// Reverse quantity left over after a flip fill
struct FlipLeg {
    parent_id: Uuid,
    parent_flip_count: u32,
    symbol: String,
    side: Side,
    entry_price: f64,
    size: f64,
    order_id: String,
}

/// Owns every open position and is the only code that mutates one.
///
/// Capital moves only through the [`CapitalLedger`] ticket calls; orders only
/// through the [`OrderGateway`]. Each operation is applied completely before the
/// next one starts.
pub struct PositionLedger {
    gateway: Arc<dyn OrderGateway>,
    capital: CapitalLedger,
    architect: PerimeterArchitect,
    config: ExecutionConfig,
    tactical_timeframe: Timeframe,
    gateway_attempts: u32,
    active: HashMap<Uuid, Position>,
    closed: Vec<Position>,
    events: Option<EventSender>,
}

impl PositionLedger {
    pub fn new(gateway: Arc<dyn OrderGateway>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            capital: CapitalLedger::new(config.initial_capital, &config.capital),
            architect: PerimeterArchitect::new(&config.perimeter),
            config: config.execution.clone(),
            tactical_timeframe: config.perimeter.tactical_timeframe,
            gateway_attempts: config.gateway.max_retries + 1,
            active: HashMap::new(),
            closed: Vec::new(),
            events: None,
        }
    }

    /// Emit a [`PositionClosed`] on `sender` after every full close
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn capital(&self) -> &CapitalLedger {
        &self.capital
    }

    pub fn position(&self, position_id: Uuid) -> Option<&Position> {
        self.active.get(&position_id)
    }

    pub fn position_for(&self, symbol: &str) -> Option<&Position> {
        self.active.values().find(|p| p.symbol == symbol)
    }

    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.active.values()
    }

    /// Every position closed this run, oldest first
    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn update_unrealized(&mut self, price: f64) {
        for position in self.active.values_mut() {
            position.update_unrealized(price);
        }
    }

    /// Ask the gateway which hedge traps fired inside the `[low, high]` range
    pub async fn poll_triggered_stops(&self, high: f64, low: f64) -> Result<Vec<TriggeredFill>> {
        self.gateway
            .check_triggered_stops(high, low)
            .await
            .map_err(|err| self.gateway_failure(err))
    }

    /// Carry out a tactical decision against the symbol's position
    pub async fn execute(
        &mut self,
        signal: &TacticalSignal,
        bundle: &ReportBundle,
    ) -> Result<ExecutionOutcome> {
        let symbol = if signal.symbol.is_empty() {
            bundle.symbol.as_str()
        } else {
            signal.symbol.as_str()
        };

        let Some(active_id) = self.position_for(symbol).map(|p| p.id) else {
            if signal.decision != DecisionKind::Advance {
                return Ok(ExecutionOutcome::Idle);
            }
            let side = signal
                .side
                .ok_or_else(|| EngineError::InvalidRequest("ADVANCE signal without a side".to_string()))?;
            let id = self.open(symbol, side, signal, bundle).await?;
            return Ok(ExecutionOutcome::Opened(id));
        };

        if signal.position_id.is_some_and(|id| id != active_id) {
            tracing::debug!(
                "Signal from {} targets {:?}, active position is {}; ignored",
                signal.source,
                signal.position_id,
                active_id
            );
            return Ok(ExecutionOutcome::Ignored);
        }

        match signal.decision {
            DecisionKind::Flip => {
                let opened = self.flip(active_id, bundle).await?;
                Ok(ExecutionOutcome::Flipped {
                    closed: active_id,
                    opened,
                })
            }
            DecisionKind::Retreat => {
                let reason = if signal.target_index.is_some() {
                    ExitReason::FinalTarget
                } else {
                    ExitReason::Retreat
                };
                let closed = self.full_close(active_id, reason, None, bundle).await?;
                Ok(ExecutionOutcome::Closed(closed))
            }
            DecisionKind::ScaleIn => {
                let ratio = signal
                    .scale_in_ratio
                    .unwrap_or(self.config.default_scale_in_ratio);
                self.scale_in(active_id, ratio, signal, bundle).await?;
                Ok(ExecutionOutcome::ScaledIn(active_id))
            }
            DecisionKind::PartialExit => {
                let ratio = signal.exit_ratio.unwrap_or(self.config.default_exit_ratio);
                match self
                    .partial_exit(active_id, ratio, signal.target_index, bundle)
                    .await?
                {
                    Some(closed) => Ok(ExecutionOutcome::Closed(closed)),
                    None => Ok(ExecutionOutcome::PartiallyExited(active_id)),
                }
            }
            DecisionKind::Advance | DecisionKind::Wait | DecisionKind::Hold => {
                Ok(ExecutionOutcome::Idle)
            }
        }
    }

    /// Open a new position: plan, reserve, fill, then arm the hedge trap
    pub async fn open(
        &mut self,
        symbol: &str,
        side: Side,
        signal: &TacticalSignal,
        bundle: &ReportBundle,
    ) -> Result<Uuid> {
        if self.position_for(symbol).is_some() {
            tracing::warn!("Entry refused: {} already has an open position", symbol);
            return Err(EngineError::PositionExists(symbol.to_string()));
        }

        let price = self.current_price(bundle)?;
        let Some(plan) = self.architect.plan(side, price, bundle) else {
            tracing::error!("Entry aborted for {}: no safe perimeter", symbol);
            return Err(EngineError::PlanUnavailable {
                symbol: symbol.to_string(),
                reason: "no numerically safe stop".to_string(),
            });
        };

        let allocation = self.capital.request_allocation(&AllocationRequest {
            decision: signal.decision,
            risk_level: signal.risk_level,
            strategic_multiplier: signal.strategic_multiplier,
            catastrophic_stop: plan.catastrophic_stop,
            entry_price: price,
        })?;

        let fill = match self
            .gateway
            .place(OrderRequest::market(symbol, side, allocation.size, price))
            .await
        {
            Ok(fill) if fill.is_filled() => fill,
            outcome => {
                self.capital.release(allocation.ticket_id);
                let err = self.unfilled(outcome, "entry");
                tracing::error!("Entry for {} failed: {}", symbol, err);
                return Err(err);
            }
        };

        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            entry_price: fill.filled_price,
            size: fill.filled_size,
            leverage: self.config.leverage,
            protective_stop: plan.protective_stop,
            catastrophic_stop: plan.catastrophic_stop,
            targets: plan.targets,
            tps_hit: 0,
            flip_count: 0,
            hedge_trap: None,
            status: PositionStatus::Open,
            strategic_intent: self.intent_at_birth(bundle),
            entry_time: bundle.timestamp,
            entry_order_id: fill.order_id,
            flipped_from: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };
        let id = position.id;

        tracing::info!(
            "ADVANCE executed: {} {:?} {} size {:.6} @ {:.4}, stop {:.4}, catastrophic {:.4} (intent {:?})",
            id,
            side,
            symbol,
            position.size,
            position.entry_price,
            position.protective_stop,
            position.catastrophic_stop,
            position.strategic_intent
        );

        self.capital.confirm_link(allocation.ticket_id, id);
        self.active.insert(id, position);
        self.protect(id, bundle).await;

        Ok(id)
    }

    /// Add to a position against its existing catastrophic stop, then re-plan at
    /// the new average entry
    pub async fn scale_in(
        &mut self,
        position_id: Uuid,
        ratio: f64,
        signal: &TacticalSignal,
        bundle: &ReportBundle,
    ) -> Result<()> {
        if !(ratio > 0.0 && ratio <= 2.0) {
            return Err(EngineError::InvalidRequest(format!(
                "scale-in ratio {ratio} outside (0, 2]"
            )));
        }
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let (symbol, side, size, entry_price, catastrophic_stop) = (
            position.symbol.clone(),
            position.side,
            position.size,
            position.entry_price,
            position.catastrophic_stop,
        );
        let price = self.current_price(bundle)?;

        self.cancel_trap(position_id).await;

        let allocation = match self.capital.request_allocation(&AllocationRequest {
            decision: DecisionKind::ScaleIn,
            risk_level: signal.risk_level,
            strategic_multiplier: signal.strategic_multiplier,
            catastrophic_stop,
            entry_price: price,
        }) {
            Ok(allocation) => allocation,
            Err(denial) => {
                self.protect(position_id, bundle).await;
                return Err(denial.into());
            }
        };

        let additional = (size * ratio).min(allocation.size);
        let fill = match self
            .gateway
            .place(OrderRequest::market(&symbol, side, additional, price))
            .await
        {
            Ok(fill) if fill.is_filled() => fill,
            outcome => {
                self.capital.release(allocation.ticket_id);
                let err = self.unfilled(outcome, "scale-in");
                tracing::error!("Scale-in for {} failed: {}", position_id, err);
                self.protect(position_id, bundle).await;
                return Err(err);
            }
        };

        let new_size = size + fill.filled_size;
        let average_entry = (size * entry_price + fill.filled_size * fill.filled_price) / new_size;
        let plan = self.architect.plan(side, average_entry, bundle);

        let position = self
            .active
            .get_mut(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        position.size = new_size;
        position.entry_price = average_entry;
        match plan {
            Some(plan) => {
                position.protective_stop = plan.protective_stop;
                position.catastrophic_stop = plan.catastrophic_stop;
                position.targets = plan.targets;
                position.tps_hit = 0;
            }
            None => tracing::warn!(
                "No fresh perimeter at average {:.4} for {}; keeping the previous one",
                average_entry,
                position_id
            ),
        }

        tracing::info!(
            "SCALE-IN executed: {} +{:.6} @ {:.4} -> size {:.6}, average {:.4}",
            position_id,
            fill.filled_size,
            fill.filled_price,
            new_size,
            average_entry
        );

        self.capital.confirm_link(allocation.ticket_id, position_id);
        self.protect(position_id, bundle).await;
        Ok(())
    }

    /// Take `ratio` of the position off. Returns the close event when the residual
    /// falls below the minimum viable size and the position is closed out.
    pub async fn partial_exit(
        &mut self,
        position_id: Uuid,
        ratio: f64,
        target_index: Option<usize>,
        bundle: &ReportBundle,
    ) -> Result<Option<PositionClosed>> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(EngineError::InvalidRequest(format!(
                "exit ratio {ratio} outside (0, 1)"
            )));
        }
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let (symbol, side, size) = (position.symbol.clone(), position.side, position.size);
        let price = self.current_price(bundle)?;
        let exit_size = size * ratio;

        self.cancel_trap(position_id).await;

        let order = OrderRequest::market(&symbol, side.opposite(), exit_size, price).reduce_only(position_id);
        let fill = match self.gateway.place(order).await {
            Ok(fill) if fill.is_filled() => fill,
            outcome => {
                let err = self.unfilled(outcome, "partial exit");
                tracing::error!("Partial exit for {} failed: {}", position_id, err);
                self.protect(position_id, bundle).await;
                return Err(err);
            }
        };

        let position = self
            .active
            .get_mut(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let filled_size = fill.filled_size.min(position.size);
        let pnl = position.pnl_at(fill.filled_price, filled_size);
        let cost_basis = filled_size * position.entry_price;
        position.size -= filled_size;
        position.realized_pnl += pnl;
        if let Some(index) = target_index {
            position.tps_hit = position.tps_hit.max(index + 1);
        }
        let remaining = position.size;

        tracing::info!(
            "PARTIAL EXIT executed: {} -{:.6} @ {:.4}, PnL ${:.2}, remaining {:.6}",
            position_id,
            filled_size,
            fill.filled_price,
            pnl,
            remaining
        );

        self.capital.release_partial(position_id, cost_basis, pnl);

        if remaining < self.config.min_viable_size {
            let closed = self
                .close(
                    position_id,
                    ExitReason::ResidualBelowMinimum,
                    Some(fill.filled_price),
                    CloseLeg::Order,
                    bundle,
                )
                .await?;
            return Ok(Some(closed));
        }

        self.protect(position_id, bundle).await;
        Ok(None)
    }

    /// Close the whole position. On a failed closing order the position stays open
    /// and its trap is re-armed.
    pub async fn full_close(
        &mut self,
        position_id: Uuid,
        reason: ExitReason,
        exit_price: Option<f64>,
        bundle: &ReportBundle,
    ) -> Result<PositionClosed> {
        self.close(position_id, reason, exit_price, CloseLeg::Order, bundle)
            .await
    }

    /// Manual flip: reverse with an enlarged market order and onboard the excess
    /// as a new position. Returns the new position, if one survived onboarding.
    pub async fn flip(&mut self, position_id: Uuid, bundle: &ReportBundle) -> Result<Option<Uuid>> {
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if position.flip_count >= self.config.max_flips_allowed {
            tracing::warn!(
                "Flip refused for {}: already flipped {} time(s)",
                position_id,
                position.flip_count
            );
            return Err(EngineError::FlipLimitReached {
                position_id,
                max: self.config.max_flips_allowed,
            });
        }
        let (symbol, side, size) = (position.symbol.clone(), position.side, position.size);
        let price = self.current_price(bundle)?;
        let flip_size = self.flip_size(size, bundle.directional_force());

        self.cancel_trap(position_id).await;

        let fill = match self
            .gateway
            .place(OrderRequest::market(&symbol, side.opposite(), flip_size, price))
            .await
        {
            Ok(fill) if fill.is_filled() => fill,
            outcome => {
                let err = self.unfilled(outcome, "flip");
                tracing::error!("Manual flip for {} failed: {}", position_id, err);
                self.protect(position_id, bundle).await;
                return Err(err);
            }
        };

        tracing::warn!(
            "Manual FLIP of {} from {:?} @ {:.4} (reverse size {:.6})",
            position_id,
            side,
            fill.filled_price,
            fill.filled_size
        );
        self.complete_flip(position_id, side.opposite(), fill, bundle).await
    }

    /// Resolve a fired hedge trap: flip when the position was born in a trend and
    /// has flips left, otherwise retreat. A fill smaller than the position always
    /// retreats, and a fill for a position that is no longer open is flattened.
    pub async fn handle_trap_trigger(
        &mut self,
        trigger: TriggeredFill,
        bundle: &ReportBundle,
    ) -> Result<TriggerOutcome> {
        if !self.active.contains_key(&trigger.parent_id) {
            self.flatten_orphan(&trigger, bundle).await;
            return Ok(TriggerOutcome::Orphaned);
        }
        let position = self
            .active
            .get_mut(&trigger.parent_id)
            .ok_or(EngineError::PositionNotFound(trigger.parent_id))?;

        match position.hedge_trap.as_mut() {
            Some(trap) if trap.order_id == trigger.trap_order_id => trap.status = TrapStatus::Triggered,
            _ => tracing::warn!(
                "Reconciliation mismatch: trap {} is not the one recorded for {}",
                trigger.trap_order_id,
                position.id
            ),
        }

        let position_id = position.id;
        let intent = position.strategic_intent;
        let flip_count = position.flip_count;
        let size = position.size;
        let symbol = position.symbol.clone();
        let max_flips = self.config.max_flips_allowed;

        if size - trigger.fill.filled_size >= self.config.min_viable_size {
            tracing::warn!(
                "FORCED RETREAT: trap {} filled {:.6} against {:.6} held by {}; no reverse position left",
                trigger.trap_order_id,
                trigger.fill.filled_size,
                size,
                position_id
            );
            self.close_uncovered(position_id, ExitReason::ForcedRetreat, &trigger.fill, bundle)
                .await?;
            return Ok(TriggerOutcome::Retreated(position_id));
        }

        if intent.is_trend() && flip_count < max_flips {
            tracing::warn!(
                "Trap triggered on {} (intent {:?}): flip #{} @ {:.4}",
                position_id,
                intent,
                flip_count + 1,
                trigger.fill.filled_price
            );
            let opened = self
                .complete_flip(position_id, trigger.side, trigger.fill, bundle)
                .await?;
            return Ok(TriggerOutcome::Flipped {
                closed: position_id,
                opened,
            });
        }

        let why = if intent.is_trend() {
            format!("flip limit of {max_flips} reached")
        } else {
            format!("intent {intent:?}")
        };
        tracing::warn!(
            "FORCED RETREAT ({}): catastrophic stop hit for {} @ {:.4}",
            why,
            position_id,
            trigger.fill.filled_price
        );

        let price = trigger.fill.filled_price;
        self.close(position_id, ExitReason::ForcedRetreat, Some(price), CloseLeg::Offset, bundle)
            .await?;

        let excess = trigger.fill.filled_size - size;
        if excess >= self.config.min_viable_size {
            match self
                .gateway
                .close(position_id, trigger.side, excess, &symbol, price)
                .await
            {
                Ok(fill) if fill.is_filled() => tracing::info!(
                    "Flattened {:.6} excess reverse quantity for {}",
                    fill.filled_size,
                    position_id
                ),
                outcome => tracing::error!(
                    "CRITICAL: {:.6} excess reverse quantity for {} left open: {}",
                    excess,
                    position_id,
                    self.unfilled(outcome, "flatten")
                ),
            }
        }

        Ok(TriggerOutcome::Retreated(position_id))
    }

    /// Second half of a flip once the reverse order has filled: close the old
    /// position as a flip leg and onboard whatever reverse size is left
    async fn complete_flip(
        &mut self,
        position_id: Uuid,
        new_side: Side,
        fill: FillResult,
        bundle: &ReportBundle,
    ) -> Result<Option<Uuid>> {
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if position.size - fill.filled_size >= self.config.min_viable_size {
            tracing::warn!(
                "Reverse fill of {:.6} does not cover {:.6} held by {}; closing the remainder",
                fill.filled_size,
                position.size,
                position_id
            );
            self.close_uncovered(position_id, ExitReason::Flip, &fill, bundle)
                .await?;
            return Ok(None);
        }
        let leg = FlipLeg {
            parent_id: position_id,
            parent_flip_count: position.flip_count,
            symbol: position.symbol.clone(),
            side: new_side,
            entry_price: fill.filled_price,
            size: fill.filled_size - position.size,
            order_id: fill.order_id,
        };

        self.close(position_id, ExitReason::Flip, Some(fill.filled_price), CloseLeg::Offset, bundle)
            .await?;

        if leg.size < self.config.min_viable_size {
            tracing::warn!(
                "Flip fill for {} left no reverse size; position closed only",
                position_id
            );
            return Ok(None);
        }

        Ok(self.onboard_flipped(leg, bundle).await)
    }

    /// A reverse fill offset only part of the position: book the covered units at
    /// the fill price, then close what is left with a regular order. A failed
    /// closing order leaves the remainder open and protected.
    async fn close_uncovered(
        &mut self,
        position_id: Uuid,
        reason: ExitReason,
        fill: &FillResult,
        bundle: &ReportBundle,
    ) -> Result<PositionClosed> {
        let position = self
            .active
            .get_mut(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let covered = fill.filled_size.clamp(0.0, position.size);
        let pnl = position.pnl_at(fill.filled_price, covered);
        let cost_basis = covered * position.entry_price;
        position.size -= covered;
        position.realized_pnl += pnl;

        tracing::info!(
            "{} offset by {:.6} @ {:.4}, PnL ${:.2}, {:.6} still held",
            position_id,
            covered,
            fill.filled_price,
            pnl,
            position.size
        );
        self.capital.release_partial(position_id, cost_basis, pnl);

        self.close(position_id, reason, None, CloseLeg::Order, bundle)
            .await
    }

    /// A trap fired for a position that is no longer open (its cancel failed on the
    /// way out). The reverse fill is flattened so no untracked exposure remains.
    async fn flatten_orphan(&self, trigger: &TriggeredFill, bundle: &ReportBundle) {
        let symbol = self
            .closed
            .iter()
            .rev()
            .find(|p| p.id == trigger.parent_id)
            .map(|p| p.symbol.clone())
            .unwrap_or_else(|| bundle.symbol.clone());
        let price = bundle
            .last_price(self.tactical_timeframe)
            .unwrap_or(trigger.fill.filled_price);

        tracing::warn!(
            "Reconciliation mismatch: trap {} fired for {} which is not open; flattening {:.6} {:?} {}",
            trigger.trap_order_id,
            trigger.parent_id,
            trigger.fill.filled_size,
            trigger.side,
            symbol
        );

        match self
            .gateway
            .close(trigger.parent_id, trigger.side, trigger.fill.filled_size, &symbol, price)
            .await
        {
            Ok(fill) if fill.is_filled() => tracing::info!(
                "Orphaned trap fill flattened: {:.6} {} @ {:.4}",
                fill.filled_size,
                symbol,
                fill.filled_price
            ),
            outcome => tracing::error!(
                "CRITICAL: orphaned trap fill of {:.6} {} left open: {}",
                trigger.fill.filled_size,
                symbol,
                self.unfilled(outcome, "orphan flatten")
            ),
        }
    }

    /// Onboard the reverse fill as a new position, or flatten it when no perimeter
    /// or capital is available
    async fn onboard_flipped(&mut self, leg: FlipLeg, bundle: &ReportBundle) -> Option<Uuid> {
        let Some(plan) = self.architect.plan(leg.side, leg.entry_price, bundle) else {
            tracing::error!(
                "No perimeter for the position flipped from {}; closing the reverse fill",
                leg.parent_id
            );
            self.safety_close(&leg).await;
            return None;
        };

        let allocation = match self.capital.request_allocation(&AllocationRequest {
            decision: DecisionKind::Flip,
            risk_level: RiskLevel::Full,
            strategic_multiplier: 1.0,
            catastrophic_stop: plan.catastrophic_stop,
            entry_price: leg.entry_price,
        }) {
            Ok(allocation) => allocation,
            Err(denial) => {
                tracing::error!(
                    "Capital denied for the position flipped from {} ({}); closing the reverse fill",
                    leg.parent_id,
                    denial
                );
                self.safety_close(&leg).await;
                return None;
            }
        };

        let position = Position {
            id: Uuid::new_v4(),
            symbol: leg.symbol,
            side: leg.side,
            entry_price: leg.entry_price,
            size: leg.size,
            leverage: self.config.leverage,
            protective_stop: plan.protective_stop,
            catastrophic_stop: plan.catastrophic_stop,
            targets: plan.targets,
            tps_hit: 0,
            flip_count: leg.parent_flip_count + 1,
            hedge_trap: None,
            status: PositionStatus::Open,
            strategic_intent: self.intent_at_birth(bundle),
            entry_time: bundle.timestamp,
            entry_order_id: leg.order_id,
            flipped_from: Some(leg.parent_id),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };
        let id = position.id;

        tracing::info!(
            "Flipped position {} onboarded from {}: {:?} size {:.6} @ {:.4}, flip count {}",
            id,
            leg.parent_id,
            position.side,
            position.size,
            position.entry_price,
            position.flip_count
        );

        self.capital.confirm_link(allocation.ticket_id, id);
        self.active.insert(id, position);
        self.protect(id, bundle).await;
        Some(id)
    }

    async fn safety_close(&self, leg: &FlipLeg) {
        match self
            .gateway
            .close(leg.parent_id, leg.side, leg.size, &leg.symbol, leg.entry_price)
            .await
        {
            Ok(fill) if fill.is_filled() => tracing::info!(
                "Safety close: {:.6} {} flattened @ {:.4}",
                fill.filled_size,
                leg.symbol,
                fill.filled_price
            ),
            outcome => tracing::error!(
                "CRITICAL: safety close of {:.6} {} failed: {}",
                leg.size,
                leg.symbol,
                self.unfilled(outcome, "safety close")
            ),
        }
    }

    async fn close(
        &mut self,
        position_id: Uuid,
        reason: ExitReason,
        exit_override: Option<f64>,
        leg: CloseLeg,
        bundle: &ReportBundle,
    ) -> Result<PositionClosed> {
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let (symbol, side, size, entry_price) = (
            position.symbol.clone(),
            position.side,
            position.size,
            position.entry_price,
        );
        let mut exit_price = exit_override
            .or_else(|| bundle.last_price(self.tactical_timeframe))
            .unwrap_or(entry_price);

        if leg == CloseLeg::Order {
            self.cancel_trap(position_id).await;
            match self.gateway.close(position_id, side, size, &symbol, exit_price).await {
                Ok(fill) if fill.is_filled() => exit_price = fill.filled_price,
                outcome => {
                    let err = self.unfilled(outcome, "close");
                    tracing::error!("Close of {} failed: {}; position stays open", position_id, err);
                    self.protect(position_id, bundle).await;
                    return Err(err);
                }
            }
        }

        let Some(mut position) = self.active.remove(&position_id) else {
            return Err(EngineError::PositionNotFound(position_id));
        };
        let final_pnl = position.pnl_at(exit_price, position.size);
        position.realized_pnl += final_pnl;
        position.unrealized_pnl = 0.0;
        position.unrealized_pnl_pct = 0.0;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(bundle.timestamp);
        position.exit_reason = Some(reason);

        self.capital.release_full(position_id, final_pnl);

        let event = PositionClosed::from_position(&position).ok_or_else(|| {
            EngineError::ReconciliationMismatch(format!("closed position {position_id} has no exit record"))
        })?;

        tracing::info!(
            "{:?}: {} closed @ {:.4}, PnL ${:.2} ({:+.2}%)",
            reason,
            position_id,
            exit_price,
            position.realized_pnl,
            event.pnl_pct
        );

        self.emit(event.clone());
        self.closed.push(position);
        Ok(event)
    }

    fn emit(&self, event: PositionClosed) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                tracing::debug!("Closed-position event dropped: no listener");
            }
        }
    }

    /// Arm a trap and log, rather than fail, when the gateway refuses it
    async fn protect(&mut self, position_id: Uuid, bundle: &ReportBundle) {
        if let Err(err) = self.arm_trap(position_id, bundle.directional_force()).await {
            tracing::error!("CRITICAL: {}; position remains open without protection", err);
        }
    }

    async fn arm_trap(&mut self, position_id: Uuid, force: f64) -> Result<()> {
        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if let Some(trap) = position.armed_trap() {
            let required = position.size * self.config.flip_size_multiplier;
            if trap.size >= required - self.config.min_viable_size {
                tracing::debug!(
                    "Trap {} still armed for {}; not re-arming",
                    trap.order_id,
                    position_id
                );
                return Ok(());
            }

            tracing::warn!(
                "Trap {} covers {:.6} of the {:.6} needed for {}; replacing it",
                trap.order_id,
                trap.size,
                required,
                position_id
            );
            self.cancel_trap(position_id).await;
        }

        let position = self
            .active
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if let Some(trap) = position.armed_trap() {
            tracing::error!(
                "Undersized trap {} for {} could not be replaced; a trigger will close the remainder",
                trap.order_id,
                position_id
            );
            return Ok(());
        }

        let trap_side = position.side.opposite();
        let trigger_price = position.catastrophic_stop;
        let size = self.flip_size(position.size, force);
        let order = OrderRequest::stop_market(&position.symbol, trap_side, size, trigger_price, position_id);

        let fill = self
            .gateway
            .place(order)
            .await
            .map_err(|err| EngineError::TrapArmFailure {
                position_id,
                message: err.to_string(),
            })?;

        if let Some(position) = self.active.get_mut(&position_id) {
            tracing::info!(
                "Hedge trap {} armed for {}: {:?} {:.6} @ {:.4}",
                fill.order_id,
                position_id,
                trap_side,
                size,
                trigger_price
            );
            position.hedge_trap = Some(HedgeTrap {
                order_id: fill.order_id,
                trigger_price,
                size,
                side: trap_side,
                status: TrapStatus::Armed,
            });
        }
        Ok(())
    }

    /// Cancel the armed trap, if any. A failed cancel leaves it armed.
    async fn cancel_trap(&mut self, position_id: Uuid) {
        let Some(order_id) = self
            .active
            .get(&position_id)
            .and_then(|p| p.armed_trap())
            .map(|t| t.order_id.clone())
        else {
            return;
        };

        match self.gateway.cancel(&order_id).await {
            Ok(found) => {
                if !found {
                    tracing::warn!(
                        "Reconciliation mismatch: trap {} was not pending at the gateway",
                        order_id
                    );
                }
                if let Some(trap) = self
                    .active
                    .get_mut(&position_id)
                    .and_then(|p| p.hedge_trap.as_mut())
                {
                    trap.status = TrapStatus::Cancelled;
                }
            }
            Err(err) => tracing::error!(
                "Failed to cancel trap {} for {}: {}; leaving it armed",
                order_id,
                position_id,
                err
            ),
        }
    }

    fn flip_size(&self, size: f64, force: f64) -> f64 {
        let multiplier = if force.abs() >= self.config.full_power_flip_threshold {
            self.config.full_power_flip_multiplier
        } else {
            self.config.flip_size_multiplier
        };
        size * multiplier
    }

    fn intent_at_birth(&self, bundle: &ReportBundle) -> MarketRegime {
        bundle
            .regime_at(self.tactical_timeframe)
            .unwrap_or(MarketRegime::Uncertain)
    }

    fn current_price(&self, bundle: &ReportBundle) -> Result<f64> {
        bundle
            .last_price(self.tactical_timeframe)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| {
                tracing::error!(
                    "No {} price for {}; operation aborted",
                    self.tactical_timeframe,
                    bundle.symbol
                );
                EngineError::PlanUnavailable {
                    symbol: bundle.symbol.clone(),
                    reason: format!("no {} close", self.tactical_timeframe),
                }
            })
    }

    /// Map a non-filled gateway outcome to the error taxonomy
    fn unfilled(&self, outcome: GatewayResult<FillResult>, what: &str) -> EngineError {
        match outcome {
            Ok(fill) => EngineError::OrderRejected(format!("{what} order {} not filled", fill.order_id)),
            Err(err) => self.gateway_failure(err),
        }
    }

    fn gateway_failure(&self, err: GatewayError) -> EngineError {
        match err {
            GatewayError::Denied(message) => EngineError::OrderRejected(message),
            GatewayError::Network(message) => EngineError::GatewayUnavailable {
                attempts: self.gateway_attempts,
                message,
            },
        }
    }
}
