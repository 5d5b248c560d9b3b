use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EventSender;
use crate::execution::{ExecutionOutcome, OrderGateway, PositionLedger, TriggerOutcome};
use crate::models::{DecisionKind, Timeframe};
use crate::reports::ReportBundle;
use crate::strategy::TacticalDecisionEngine;

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub decision: DecisionKind,
    pub execution: Option<ExecutionOutcome>,
    pub triggers: Vec<TriggerOutcome>,
    /// Set when a gateway outage cut the tick short
    pub abandoned: bool,
}

impl TickOutcome {
    fn new(decision: DecisionKind) -> Self {
        Self {
            decision,
            execution: None,
            triggers: Vec::new(),
            abandoned: false,
        }
    }
}

/// Drives one report bundle at a time through decision, execution and trap
/// resolution. Ticks never overlap.
pub struct TradingEngine {
    tactical: TacticalDecisionEngine,
    ledger: PositionLedger,
    tactical_timeframe: Timeframe,
}

impl TradingEngine {
    pub fn new(config: &EngineConfig, gateway: Arc<dyn OrderGateway>) -> Self {
        let tactical_timeframe = config.perimeter.tactical_timeframe;
        Self {
            tactical: TacticalDecisionEngine::new(&config.tactical, tactical_timeframe),
            ledger: PositionLedger::new(gateway, config),
            tactical_timeframe,
        }
    }

    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.ledger = self.ledger.with_events(sender);
        self
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut PositionLedger {
        &mut self.ledger
    }

    /// Evaluate, execute, mark to market, then resolve any fired traps.
    ///
    /// Execution failures are logged and absorbed. Only an exhausted gateway retry
    /// budget abandons the rest of the tick.
    pub async fn on_tick(&mut self, bundle: &ReportBundle) -> TickOutcome {
        let position = self.ledger.position_for(&bundle.symbol);
        let evaluation = self.tactical.evaluate(bundle, position);
        let mut outcome = TickOutcome::new(evaluation.decision);

        if let Some(signal) = evaluation.signal.as_ref() {
            match self.ledger.execute(signal, bundle).await {
                Ok(execution) => outcome.execution = Some(execution),
                Err(err) if err.abandons_tick() => {
                    tracing::warn!("Tick abandoned for {}: {}", bundle.symbol, err);
                    outcome.abandoned = true;
                    return outcome;
                }
                Err(err) => log_failure(signal.decision, &err),
            }
        }

        let Some(candle) = bundle.last_candle(self.tactical_timeframe) else {
            return outcome;
        };
        let (high, low, close) = (candle.high, candle.low, candle.close);
        self.ledger.update_unrealized(close);

        let fired = match self.ledger.poll_triggered_stops(high, low).await {
            Ok(fired) => fired,
            Err(err) => {
                tracing::warn!("Tick abandoned for {}: {}", bundle.symbol, err);
                outcome.abandoned = true;
                return outcome;
            }
        };

        for trigger in fired {
            let parent = trigger.parent_id;
            match self.ledger.handle_trap_trigger(trigger, bundle).await {
                Ok(resolved) => outcome.triggers.push(resolved),
                Err(err) if err.abandons_tick() => {
                    tracing::warn!("Trap resolution for {} abandoned: {}", parent, err);
                    outcome.abandoned = true;
                    return outcome;
                }
                Err(err) => tracing::error!("Trap resolution for {} failed: {}", parent, err),
            }
        }

        outcome
    }

    /// Position currently held on `symbol`, if any
    pub fn active_position(&self, symbol: &str) -> Option<Uuid> {
        self.ledger.position_for(symbol).map(|p| p.id)
    }
}

fn log_failure(decision: DecisionKind, err: &EngineError) {
    match err {
        EngineError::AllocationDenied(_) | EngineError::ReconciliationMismatch(_) => {
            tracing::warn!("{:?} not executed: {}", decision, err)
        }
        _ => tracing::error!("{:?} failed: {}", decision, err),
    }
}
