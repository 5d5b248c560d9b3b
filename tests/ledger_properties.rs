//! Property tests for the capital and perimeter invariants:
//! 1. Allocated cost always equals the sum of active tickets and never goes negative
//! 2. The catastrophic stop sits strictly beyond the protective stop
//! 3. Staged targets move strictly away from entry and their fractions sum to one

use chrono::{Duration, Utc};
use proptest::prelude::*;
use tradeguard::config::{CapitalConfig, ExposureOverflow, PerimeterConfig};
use tradeguard::reports::{PriceZone, StructuralEvent, StructuralEventKind};
use tradeguard::risk::{AllocationRequest, CapitalLedger, PerimeterArchitect, TicketId};
use tradeguard::{Candle, DecisionKind, ReportBundle, RiskLevel, Side, Timeframe};
use uuid::Uuid;

// ── Strategies ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum LedgerOp {
    Request { entry: f64, stop_distance: f64 },
    Link(usize),
    Release(usize),
    Partial { index: usize, share: f64, pnl: f64 },
    Full { index: usize, pnl: f64 },
}

fn arb_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (10.0..500.0_f64, 0.1..20.0_f64)
            .prop_map(|(entry, stop_distance)| LedgerOp::Request { entry, stop_distance }),
        (0..8usize).prop_map(LedgerOp::Link),
        (0..8usize).prop_map(LedgerOp::Release),
        (0..8usize, 0.0..1.5_f64, -50.0..50.0_f64)
            .prop_map(|(index, share, pnl)| LedgerOp::Partial { index, share, pnl }),
        (0..8usize, -50.0..50.0_f64).prop_map(|(index, pnl)| LedgerOp::Full { index, pnl }),
    ]
}

fn arb_overflow() -> impl Strategy<Value = ExposureOverflow> {
    prop_oneof![Just(ExposureOverflow::Deny), Just(ExposureOverflow::Cap)]
}

fn arb_side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Long), Just(Side::Short)]
}

fn assert_reconciled(ledger: &CapitalLedger) -> Result<(), TestCaseError> {
    let reserved: f64 = ledger.active_tickets().map(|t| t.current_amount).sum();
    prop_assert!(ledger.total_allocated_cost() >= 0.0);
    prop_assert!((ledger.total_allocated_cost() - reserved).abs() < 1e-6);
    for ticket in ledger.active_tickets() {
        prop_assert!(ticket.current_amount >= 0.0);
        prop_assert!(ticket.current_amount <= ticket.original_amount + 1e-9);
    }
    Ok(())
}

fn bundle(price: f64, spread: f64, swings: &[(StructuralEventKind, f64)], blocks: &[(f64, f64)]) -> ReportBundle {
    let now = Utc::now();
    let mut bundle = ReportBundle::new("ETH/USDT", now);
    bundle.ohlcv.set(
        Timeframe::M5,
        (0..20)
            .map(|i| Candle {
                timestamp: now - Duration::minutes(5 * (20 - i)),
                open: price,
                high: price + spread,
                low: price - spread,
                close: price,
                volume: 1.0,
            })
            .collect(),
    );

    let structure = bundle.structure.get_or_insert_with(Default::default);
    structure.narrative.set(
        Timeframe::H1,
        swings
            .iter()
            .map(|&(kind, price_level)| StructuralEvent {
                kind,
                price_level,
                confidence: 1.0,
            })
            .collect(),
    );
    for &(low, high) in blocks {
        let zones = bundle.order_blocks.get_mut(Timeframe::H1);
        zones.bullish.push(PriceZone::new(low, high));
        zones.bearish.push(PriceZone::new(low, high));
    }
    bundle
}

// ── 1. Capital reconciliation ───────────────────────────────────────

proptest! {
    /// Every request, link and release keeps the running total equal to the sum
    /// of what the active tickets still hold.
    #[test]
    fn allocated_cost_reconciles_with_tickets(
        ops in prop::collection::vec(arb_op(), 1..60),
        overflow in arb_overflow(),
    ) {
        let config = CapitalConfig {
            max_exposure_percent: 60.0,
            exposure_overflow: overflow,
            ..CapitalConfig::default()
        };
        let mut ledger = CapitalLedger::new(10_000.0, &config);
        let mut issued: Vec<(TicketId, Option<Uuid>)> = Vec::new();

        for op in ops {
            match op {
                LedgerOp::Request { entry, stop_distance } => {
                    let request = AllocationRequest {
                        decision: DecisionKind::Advance,
                        risk_level: RiskLevel::Full,
                        strategic_multiplier: 1.0,
                        catastrophic_stop: entry - stop_distance,
                        entry_price: entry,
                    };
                    if let Ok(allocation) = ledger.request_allocation(&request) {
                        prop_assert!(allocation.amount > 0.0);
                        issued.push((allocation.ticket_id, None));
                    }
                }
                LedgerOp::Link(index) => {
                    if let Some((ticket_id, linked)) = issued.get_mut(index) {
                        let position_id = Uuid::new_v4();
                        if ledger.confirm_link(*ticket_id, position_id) {
                            *linked = Some(position_id);
                        }
                    }
                }
                LedgerOp::Release(index) => {
                    if let Some((ticket_id, _)) = issued.get(index) {
                        ledger.release(*ticket_id);
                    }
                }
                LedgerOp::Partial { index, share, pnl } => {
                    if let Some((_, Some(position_id))) = issued.get(index) {
                        let reserved = ledger.reserved_for(*position_id);
                        let released = ledger.release_partial(*position_id, reserved * share, pnl);
                        prop_assert!(released <= reserved + 1e-9);
                    }
                }
                LedgerOp::Full { index, pnl } => {
                    if let Some((_, Some(position_id))) = issued.get(index) {
                        ledger.release_full(*position_id, pnl);
                        prop_assert_eq!(ledger.reserved_for(*position_id), 0.0);
                    }
                }
            }
            assert_reconciled(&ledger)?;
        }
    }

    /// Reservations never push allocated cost past the cap in force when issued
    #[test]
    fn reservations_respect_exposure_cap(
        entries in prop::collection::vec((10.0..500.0_f64, 0.1..5.0_f64), 1..30),
        overflow in arb_overflow(),
    ) {
        let config = CapitalConfig {
            max_exposure_percent: 25.0,
            exposure_overflow: overflow,
            ..CapitalConfig::default()
        };
        let mut ledger = CapitalLedger::new(10_000.0, &config);

        for (entry, stop_distance) in entries {
            let _ = ledger.request_allocation(&AllocationRequest {
                decision: DecisionKind::Advance,
                risk_level: RiskLevel::Half,
                strategic_multiplier: 1.0,
                catastrophic_stop: entry - stop_distance,
                entry_price: entry,
            });
            prop_assert!(ledger.total_allocated_cost() <= ledger.exposure_cap() + 1e-6);
        }
    }
}

// ── 2 & 3. Perimeter geometry ───────────────────────────────────────

proptest! {
    #[test]
    fn perimeter_orders_stops_and_targets(
        side in arb_side(),
        price in 10.0..1000.0_f64,
        spread_pct in 0.05..3.0_f64,
        swing_offsets in prop::collection::vec((-20.0..20.0_f64, any::<bool>()), 0..6),
        block_offsets in prop::collection::vec(-10.0..10.0_f64, 0..3),
    ) {
        let spread = price * spread_pct / 100.0;
        let swings: Vec<(StructuralEventKind, f64)> = swing_offsets
            .iter()
            .map(|&(offset, high)| {
                let kind = if high { StructuralEventKind::SwingHigh } else { StructuralEventKind::SwingLow };
                (kind, price * (1.0 + offset / 100.0))
            })
            .collect();
        let blocks: Vec<(f64, f64)> = block_offsets
            .iter()
            .map(|offset| {
                let low = price * (1.0 + offset / 100.0);
                (low, low + spread / 2.0)
            })
            .collect();

        let architect = PerimeterArchitect::new(&PerimeterConfig::default());
        let bundle = bundle(price, spread, &swings, &blocks);
        let plan = architect.plan(side, price, &bundle);
        prop_assert!(plan.is_some());
        let plan = plan.unwrap();
        let sign = side.sign();

        // protective on the loss side, catastrophic strictly further out
        prop_assert!((price - plan.protective_stop) * sign > 0.0);
        prop_assert!((plan.protective_stop - plan.catastrophic_stop) * sign > 0.0);

        prop_assert!(!plan.targets.is_empty());
        let mut previous = price;
        for target in &plan.targets {
            prop_assert!((target.price - previous) * sign > 0.0);
            prop_assert!(target.exit_fraction > 0.0);
            previous = target.price;
        }
        let total: f64 = plan.targets.iter().map(|t| t.exit_fraction).sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
    }
}
