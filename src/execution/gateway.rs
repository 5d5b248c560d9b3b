use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    StopMarket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub kind: OrderKind,
    /// Reference price for market fills
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub parent_id: Option<Uuid>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, size: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size,
            kind: OrderKind::Market,
            price: Some(price),
            trigger_price: None,
            parent_id: None,
            reduce_only: false,
        }
    }

    /// Conditional reverse order guarding `parent_id`
    pub fn stop_market(symbol: &str, side: Side, size: f64, trigger_price: f64, parent_id: Uuid) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size,
            kind: OrderKind::StopMarket,
            price: None,
            trigger_price: Some(trigger_price),
            parent_id: Some(parent_id),
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self, parent_id: Uuid) -> Self {
        self.reduce_only = true;
        self.parent_id = Some(parent_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    Filled,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: String,
    pub status: FillStatus,
    pub filled_price: f64,
    pub filled_size: f64,
}

impl FillResult {
    pub fn is_filled(&self) -> bool {
        self.status == FillStatus::Filled
    }
}

/// A conditional order that fired, attributed to the position it guarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredFill {
    pub fill: FillResult,
    pub side: Side,
    pub parent_id: Uuid,
    pub trap_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// The venue refused the order; retrying will not help
    #[error("order denied: {0}")]
    Denied(String),

    #[error("network fault: {0}")]
    Network(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Order placement surface the position ledger drives
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place(&self, order: OrderRequest) -> GatewayResult<FillResult>;

    /// False when the order was not pending
    async fn cancel(&self, order_id: &str) -> GatewayResult<bool>;

    /// Flatten `size` units of `side` exposure held for `position_id`
    async fn close(
        &self,
        position_id: Uuid,
        side: Side,
        size: f64,
        symbol: &str,
        price: f64,
    ) -> GatewayResult<FillResult>;

    async fn check_triggered_stops(&self, high: f64, low: f64) -> GatewayResult<Vec<TriggeredFill>>;
}
