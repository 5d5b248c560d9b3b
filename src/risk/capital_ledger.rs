use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{CapitalConfig, ExposureOverflow};
use crate::error::DenialReason;
use crate::models::{DecisionKind, RiskLevel};

const MIN_RISK_PER_UNIT: f64 = 1e-9;

/// Sequential ticket id; ordering doubles as issue order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TicketId(u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tkt-{:06}", self.0)
    }
}

/// A reservation of capital backing one fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationTicket {
    pub id: TicketId,
    pub decision: DecisionKind,
    pub original_amount: f64,
    /// Never grows after issue
    pub current_amount: f64,
    /// Unset until the fill is confirmed; only linked tickets release partially
    pub position_id: Option<Uuid>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocationRequest {
    pub decision: DecisionKind,
    pub risk_level: RiskLevel,
    pub strategic_multiplier: f64,
    pub catastrophic_stop: f64,
    pub entry_price: f64,
}

/// Issued reservation: ticket plus the sizing it was computed from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub ticket_id: TicketId,
    pub amount: f64,
    pub size: f64,
    pub capital_at_risk: f64,
}

/// Sole owner of capital and of every reservation against it
#[derive(Debug, Clone)]
pub struct CapitalLedger {
    config: CapitalConfig,
    initial_capital: f64,
    current_capital: f64,
    total_allocated_cost: f64,
    tickets: BTreeMap<TicketId, AllocationTicket>,
    next_ticket: u64,
}

impl CapitalLedger {
    pub fn new(initial_capital: f64, config: &CapitalConfig) -> Self {
        tracing::info!(
            "Capital ledger ready: ${:.2} (risk {}%, exposure cap {}%, compounding {:.0}%)",
            initial_capital,
            config.risk_per_trade_percent,
            config.max_exposure_percent,
            config.reinvestment_aggressiveness * 100.0
        );

        Self {
            config: config.clone(),
            initial_capital,
            current_capital: initial_capital,
            total_allocated_cost: 0.0,
            tickets: BTreeMap::new(),
            next_ticket: 1,
        }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn current_capital(&self) -> f64 {
        self.current_capital
    }

    pub fn total_allocated_cost(&self) -> f64 {
        self.total_allocated_cost
    }

    pub fn exposure_cap(&self) -> f64 {
        self.current_capital * self.config.max_exposure_percent / 100.0
    }

    /// Remaining room under the exposure cap (never negative)
    pub fn headroom(&self) -> f64 {
        (self.exposure_cap() - self.total_allocated_cost).max(0.0)
    }

    pub fn active_tickets(&self) -> impl Iterator<Item = &AllocationTicket> {
        self.tickets.values().filter(|t| t.active)
    }

    pub fn ticket(&self, ticket_id: TicketId) -> Option<&AllocationTicket> {
        self.tickets.get(&ticket_id)
    }

    /// Capital currently reserved against a position
    pub fn reserved_for(&self, position_id: Uuid) -> f64 {
        self.active_tickets()
            .filter(|t| t.position_id == Some(position_id))
            .map(|t| t.current_amount)
            .sum()
    }

    /// Initial capital plus the reinvested share of realized profit
    fn risk_base_capital(&self) -> f64 {
        let profit = self.current_capital - self.initial_capital;
        if self.config.reinvestment_aggressiveness <= 0.0 || profit <= 0.0 {
            return self.initial_capital;
        }

        let reinvested = profit * self.config.reinvestment_aggressiveness;
        tracing::debug!(
            "Risk base: ${:.2} initial + ${:.2} reinvested",
            self.initial_capital,
            reinvested
        );
        self.initial_capital + reinvested
    }

    pub fn request_allocation(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Allocation, DenialReason> {
        let entry = request.entry_price;
        let stop = request.catastrophic_stop;
        if !(entry > 0.0) || !stop.is_finite() || stop < 0.0 {
            tracing::warn!("Allocation denied: invalid entry {} / stop {}", entry, stop);
            return Err(DenialReason::InvalidStop);
        }

        let risk_per_unit = (entry - stop).abs();
        if risk_per_unit < MIN_RISK_PER_UNIT {
            tracing::warn!("Allocation denied: risk per unit is zero (entry {} = stop {})", entry, stop);
            return Err(DenialReason::ZeroRiskPerUnit);
        }

        let level_multiplier = self.config.risk_level_multipliers.for_level(request.risk_level);
        let risk_fraction = self.config.risk_per_trade_percent / 100.0
            * level_multiplier
            * request.strategic_multiplier;
        let capital_at_risk = self.risk_base_capital() * risk_fraction;

        let mut size = capital_at_risk / risk_per_unit;
        let mut notional = size * entry;

        let cap = self.exposure_cap();
        let headroom = cap - self.total_allocated_cost;
        if headroom <= 0.0 || notional > headroom {
            match self.config.exposure_overflow {
                ExposureOverflow::Cap if headroom > 0.0 => {
                    tracing::warn!(
                        "Allocation capped by exposure: ${:.2} -> ${:.2}",
                        notional,
                        headroom
                    );
                    notional = headroom;
                    size = notional / entry;
                }
                _ => {
                    tracing::warn!(
                        "Allocation denied: ${:.2} allocated + ${:.2} requested exceeds cap ${:.2}",
                        self.total_allocated_cost,
                        notional,
                        cap
                    );
                    return Err(DenialReason::ExposureCapReached {
                        allocated: self.total_allocated_cost,
                        requested: notional,
                        cap,
                    });
                }
            }
        }

        if notional <= self.config.min_allocation_notional {
            tracing::warn!(
                "Allocation denied: ${:.4} is below the ${:.4} minimum",
                notional,
                self.config.min_allocation_notional
            );
            return Err(DenialReason::BelowMinimumNotional {
                notional,
                minimum: self.config.min_allocation_notional,
            });
        }

        let id = TicketId(self.next_ticket);
        self.next_ticket += 1;
        self.tickets.insert(
            id,
            AllocationTicket {
                id,
                decision: request.decision,
                original_amount: notional,
                current_amount: notional,
                position_id: None,
                active: true,
            },
        );
        self.total_allocated_cost += notional;

        tracing::info!(
            "Ticket {} issued for {:?} ({:?}): ${:.2} at risk -> size {:.6}, notional ${:.2}",
            id,
            request.decision,
            request.risk_level,
            capital_at_risk,
            size,
            notional
        );

        Ok(Allocation {
            ticket_id: id,
            amount: notional,
            size,
            capital_at_risk,
        })
    }

    /// Attach a confirmed fill's position to its ticket. Returns false for unknown or
    /// already-linked tickets.
    pub fn confirm_link(&mut self, ticket_id: TicketId, position_id: Uuid) -> bool {
        match self.tickets.get_mut(&ticket_id) {
            Some(ticket) if ticket.active && ticket.position_id.is_none() => {
                ticket.position_id = Some(position_id);
                tracing::info!("Ticket {} linked to position {}", ticket_id, position_id);
                true
            }
            Some(ticket) => {
                tracing::warn!(
                    "Ticket {} not linkable (active: {}, linked: {:?})",
                    ticket_id,
                    ticket.active,
                    ticket.position_id
                );
                false
            }
            None => {
                tracing::warn!("Reconciliation mismatch: ticket {} not found for link", ticket_id);
                false
            }
        }
    }

    /// Return a whole reservation after an order failed before any fill
    pub fn release(&mut self, ticket_id: TicketId) -> f64 {
        let Some(ticket) = self.tickets.get_mut(&ticket_id).filter(|t| t.active) else {
            tracing::warn!("Reconciliation mismatch: no active ticket {} to release", ticket_id);
            return 0.0;
        };

        let amount = ticket.current_amount;
        ticket.current_amount = 0.0;
        ticket.active = false;
        self.total_allocated_cost = (self.total_allocated_cost - amount).max(0.0);

        tracing::info!("Ticket {} released (${:.2} returned)", ticket_id, amount);
        amount
    }

    /// Reduce the position's linked tickets by `cost_basis`, oldest first, and credit
    /// `realized_pnl`. Returns the cost actually released.
    pub fn release_partial(&mut self, position_id: Uuid, cost_basis: f64, realized_pnl: f64) -> f64 {
        let mut remaining = cost_basis.max(0.0);
        let mut released = 0.0;
        let mut found = false;

        for ticket in self
            .tickets
            .values_mut()
            .filter(|t| t.active && t.position_id == Some(position_id))
        {
            found = true;
            if remaining <= 0.0 {
                break;
            }
            let amount = ticket.current_amount.min(remaining);
            ticket.current_amount -= amount;
            remaining -= amount;
            released += amount;
            tracing::debug!(
                "Ticket {} reduced by ${:.2} (remaining ${:.2})",
                ticket.id,
                amount,
                ticket.current_amount
            );
        }

        if !found {
            tracing::warn!(
                "Reconciliation mismatch: no linked ticket for position {} on partial release",
                position_id
            );
        } else if remaining > 1e-6 {
            tracing::warn!(
                "Reconciliation mismatch: cost basis ${:.2} exceeds reserved capital for {} (${:.2} unreleased)",
                cost_basis,
                position_id,
                remaining
            );
        }

        self.total_allocated_cost = (self.total_allocated_cost - released).max(0.0);
        self.current_capital += realized_pnl;

        tracing::info!(
            "Partial release for {}: ${:.2} cost, PnL ${:.2} -> capital ${:.2}, allocated ${:.2}",
            position_id,
            released,
            realized_pnl,
            self.current_capital,
            self.total_allocated_cost
        );
        released
    }

    /// Release every ticket linked to the position and credit the PnL of the closing leg.
    /// Earlier partial exits were credited when they happened.
    pub fn release_full(&mut self, position_id: Uuid, realized_pnl: f64) -> f64 {
        let mut released = 0.0;
        let mut count = 0;

        for ticket in self
            .tickets
            .values_mut()
            .filter(|t| t.active && t.position_id == Some(position_id))
        {
            released += ticket.current_amount;
            ticket.current_amount = 0.0;
            ticket.active = false;
            count += 1;
        }

        if count == 0 {
            tracing::warn!(
                "Reconciliation mismatch: release requested for position {} but no tickets found",
                position_id
            );
        }

        self.total_allocated_cost = (self.total_allocated_cost - released).max(0.0);
        self.current_capital += realized_pnl;

        tracing::info!(
            "Capital released for {}: {} ticket(s), ${:.2}, PnL ${:.2} -> capital ${:.2}",
            position_id,
            count,
            released,
            realized_pnl,
            self.current_capital
        );
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ledger_with_exposure(max_exposure_percent: f64) -> CapitalLedger {
        let config = CapitalConfig {
            max_exposure_percent,
            ..CapitalConfig::default()
        };
        CapitalLedger::new(10_000.0, &config)
    }

    fn request(entry_price: f64, catastrophic_stop: f64) -> AllocationRequest {
        AllocationRequest {
            decision: DecisionKind::Advance,
            risk_level: RiskLevel::Full,
            strategic_multiplier: 1.0,
            catastrophic_stop,
            entry_price,
        }
    }

    #[test]
    fn test_risk_based_sizing() {
        let mut ledger = ledger_with_exposure(50.0);
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();

        assert_relative_eq!(allocation.capital_at_risk, 100.0);
        assert_relative_eq!(allocation.size, 20.0);
        assert_relative_eq!(allocation.amount, 2_000.0);
        assert_relative_eq!(ledger.total_allocated_cost(), 2_000.0);
    }

    #[test]
    fn test_zero_risk_per_unit_denied() {
        let mut ledger = ledger_with_exposure(50.0);
        let result = ledger.request_allocation(&request(100.0, 100.0));

        assert_eq!(result, Err(DenialReason::ZeroRiskPerUnit));
        assert_eq!(ledger.active_tickets().count(), 0);
        assert_eq!(ledger.total_allocated_cost(), 0.0);
    }

    #[test]
    fn test_exposure_breach_denied_by_default() {
        let mut ledger = ledger_with_exposure(10.0);
        let result = ledger.request_allocation(&request(100.0, 95.0));

        assert!(matches!(result, Err(DenialReason::ExposureCapReached { .. })));
        assert_eq!(ledger.total_allocated_cost(), 0.0);
    }

    #[test]
    fn test_exposure_overflow_cap_policy_reserves_headroom() {
        let config = CapitalConfig {
            exposure_overflow: ExposureOverflow::Cap,
            ..CapitalConfig::default()
        };
        let mut ledger = CapitalLedger::new(10_000.0, &config);
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();

        assert_relative_eq!(allocation.amount, 1_000.0);
        assert_relative_eq!(allocation.size, 10.0);
        assert_relative_eq!(ledger.headroom(), 0.0);
        assert!(ledger.request_allocation(&request(100.0, 95.0)).is_err());
    }

    #[test]
    fn test_risk_level_and_strategic_multiplier_scale_risk() {
        let mut ledger = ledger_with_exposure(100.0);
        let mut scout = request(100.0, 95.0);
        scout.risk_level = RiskLevel::Scout;
        scout.strategic_multiplier = 2.0;

        let allocation = ledger.request_allocation(&scout).unwrap();
        // 10_000 * 1% * 0.25 * 2.0
        assert_relative_eq!(allocation.capital_at_risk, 50.0);
        assert_relative_eq!(allocation.size, 10.0);
    }

    #[test]
    fn test_below_minimum_notional_denied() {
        let config = CapitalConfig {
            max_exposure_percent: 100.0,
            min_allocation_notional: 5_000.0,
            ..CapitalConfig::default()
        };
        let mut ledger = CapitalLedger::new(10_000.0, &config);

        assert!(matches!(
            ledger.request_allocation(&request(100.0, 95.0)),
            Err(DenialReason::BelowMinimumNotional { .. })
        ));
    }

    #[test]
    fn test_unlinked_ticket_not_partially_released() {
        let mut ledger = ledger_with_exposure(50.0);
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();
        let position_id = Uuid::new_v4();

        let released = ledger.release_partial(position_id, 500.0, 0.0);
        assert_eq!(released, 0.0);
        assert_relative_eq!(ledger.total_allocated_cost(), 2_000.0);

        // full release still works for an unlinked ticket
        assert_relative_eq!(ledger.release(allocation.ticket_id), 2_000.0);
        assert_eq!(ledger.total_allocated_cost(), 0.0);
        assert_eq!(ledger.active_tickets().count(), 0);
    }

    #[test]
    fn test_link_is_single_assignment() {
        let mut ledger = ledger_with_exposure(50.0);
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();

        assert!(ledger.confirm_link(allocation.ticket_id, Uuid::new_v4()));
        assert!(!ledger.confirm_link(allocation.ticket_id, Uuid::new_v4()));
    }

    #[test]
    fn test_partial_release_oldest_ticket_first() {
        let mut ledger = ledger_with_exposure(100.0);
        let position_id = Uuid::new_v4();

        let first = ledger.request_allocation(&request(100.0, 95.0)).unwrap();
        let second = ledger.request_allocation(&request(100.0, 90.0)).unwrap();
        ledger.confirm_link(first.ticket_id, position_id);
        ledger.confirm_link(second.ticket_id, position_id);

        let released = ledger.release_partial(position_id, 2_500.0, 50.0);

        assert_relative_eq!(released, 2_500.0);
        assert_relative_eq!(ledger.ticket(first.ticket_id).unwrap().current_amount, 0.0);
        assert_relative_eq!(ledger.ticket(second.ticket_id).unwrap().current_amount, 500.0);
        assert_relative_eq!(ledger.total_allocated_cost(), 500.0);
        assert_relative_eq!(ledger.current_capital(), 10_050.0);
    }

    #[test]
    fn test_release_full_credits_pnl_and_clears_tickets() {
        let mut ledger = ledger_with_exposure(50.0);
        let position_id = Uuid::new_v4();
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();
        ledger.confirm_link(allocation.ticket_id, position_id);

        let released = ledger.release_full(position_id, -75.0);

        assert_relative_eq!(released, 2_000.0);
        assert_eq!(ledger.total_allocated_cost(), 0.0);
        assert_relative_eq!(ledger.current_capital(), 9_925.0);
        assert!(!ledger.ticket(allocation.ticket_id).unwrap().active);
    }

    #[test]
    fn test_compounding_raises_risk_base_only_on_profit() {
        let config = CapitalConfig {
            max_exposure_percent: 100.0,
            reinvestment_aggressiveness: 0.5,
            ..CapitalConfig::default()
        };
        let mut ledger = CapitalLedger::new(10_000.0, &config);
        let position_id = Uuid::new_v4();
        let first = ledger.request_allocation(&request(100.0, 95.0)).unwrap();
        ledger.confirm_link(first.ticket_id, position_id);
        ledger.release_full(position_id, 2_000.0);

        // base = 10_000 + 0.5 * 2_000
        let allocation = ledger.request_allocation(&request(100.0, 95.0)).unwrap();
        assert_relative_eq!(allocation.capital_at_risk, 110.0);
    }

    #[test]
    fn test_ticket_id_display() {
        assert_eq!(TicketId(42).to_string(), "tkt-000042");
    }
}
