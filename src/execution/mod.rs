// Order routing and position lifecycle
pub mod gateway;
pub mod position;
pub mod position_ledger;
pub mod resilient;
pub mod simulated;

pub use gateway::{
    FillResult, FillStatus, GatewayError, GatewayResult, OrderGateway, OrderKind, OrderRequest,
    TriggeredFill,
};
pub use position::{ExitReason, HedgeTrap, Position, PositionStatus, TrapStatus};
pub use position_ledger::{ExecutionOutcome, PositionLedger, TriggerOutcome};
pub use resilient::{ResilientGateway, RetryPolicy};
pub use simulated::SimulatedGateway;
