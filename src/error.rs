use thiserror::Error;
use uuid::Uuid;

/// Why the capital ledger refused to reserve capital
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenialReason {
    #[error("exposure cap reached: allocated {allocated:.2} + requested {requested:.2} exceeds cap {cap:.2}")]
    ExposureCapReached {
        allocated: f64,
        requested: f64,
        cap: f64,
    },

    #[error("risk per unit is numerically zero")]
    ZeroRiskPerUnit,

    #[error("notional {notional:.4} is below the minimum viable {minimum:.4}")]
    BelowMinimumNotional { notional: f64, minimum: f64 },

    #[error("invalid stop or entry price")]
    InvalidStop,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("allocation denied: {0}")]
    AllocationDenied(#[from] DenialReason),

    #[error("no risk plan for {symbol}: {reason}")]
    PlanUnavailable { symbol: String, reason: String },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("gateway unavailable after {attempts} attempts: {message}")]
    GatewayUnavailable { attempts: u32, message: String },

    #[error("failed to arm hedge trap for {position_id}: {message}")]
    TrapArmFailure { position_id: Uuid, message: String },

    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error("position already open for {0}")]
    PositionExists(String),

    #[error("position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("position {position_id} already flipped the maximum {max} times")]
    FlipLimitReached { position_id: Uuid, max: u32 },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("configuration source error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Gateway exhaustion abandons the tick; everything else is local to one operation
    pub fn abandons_tick(&self) -> bool {
        matches!(self, EngineError::GatewayUnavailable { .. })
    }
}
