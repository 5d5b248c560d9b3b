use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::execution::gateway::{
    FillResult, FillStatus, GatewayError, GatewayResult, OrderGateway, OrderKind, OrderRequest,
    TriggeredFill,
};
use crate::models::Side;

#[derive(Debug, Clone)]
struct PendingStop {
    symbol: String,
    side: Side,
    size: f64,
    trigger_price: f64,
    parent_id: Uuid,
}

/// In-memory gateway: market orders fill at the reference price, stop orders wait
/// for `check_triggered_stops`. Every fill moves the signed net exposure of its
/// symbol.
///
/// The switches let tests and demos inject venue faults.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    pending: Mutex<HashMap<String, PendingStop>>,
    exposure: Mutex<HashMap<String, f64>>,
    reject_orders: AtomicBool,
    reject_stop_orders: AtomicBool,
    fail_cancels: AtomicBool,
    network_failures: AtomicU32,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny every market order and close
    pub fn set_reject_orders(&self, reject: bool) {
        self.reject_orders.store(reject, Ordering::SeqCst);
    }

    pub fn set_reject_stop_orders(&self, reject: bool) {
        self.reject_stop_orders.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_cancels(&self, fail: bool) {
        self.fail_cancels.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a network fault
    pub fn inject_network_failures(&self, count: u32) {
        self.network_failures.store(count, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Pending stop ids guarding `parent_id`
    pub fn pending_for(&self, parent_id: Uuid) -> Vec<String> {
        self.lock_pending()
            .iter()
            .filter(|(_, stop)| stop.parent_id == parent_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Signed units held on `symbol`: long positive, short negative
    pub fn net_exposure(&self, symbol: &str) -> f64 {
        self.lock_exposure().get(symbol).copied().unwrap_or(0.0)
    }

    fn lock_exposure(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.exposure.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_fill(&self, symbol: &str, side: Side, size: f64) {
        *self.lock_exposure().entry(symbol.to_string()).or_insert(0.0) += side.sign() * size;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingStop>> {
        // a poisoned map is still consistent: every mutation is a single insert or remove
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_network_fault(&self) -> GatewayResult<()> {
        let consumed = self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(GatewayError::Network("simulated connection reset".to_string()))
        } else {
            Ok(())
        }
    }

    fn new_order_id() -> String {
        format!("sim-{}", &Uuid::new_v4().simple().to_string()[..10])
    }
}

#[async_trait]
impl OrderGateway for SimulatedGateway {
    async fn place(&self, order: OrderRequest) -> GatewayResult<FillResult> {
        self.take_network_fault()?;

        if !(order.size > 0.0) {
            return Err(GatewayError::Denied(format!("invalid size {}", order.size)));
        }

        let order_id = Self::new_order_id();
        match order.kind {
            OrderKind::StopMarket => {
                if self.reject_stop_orders.load(Ordering::SeqCst) {
                    return Err(GatewayError::Denied("stop orders disabled".to_string()));
                }
                let (Some(trigger_price), Some(parent_id)) = (order.trigger_price, order.parent_id) else {
                    tracing::error!("STOP_MARKET needs a trigger price and a parent id, rejected");
                    return Err(GatewayError::Denied(
                        "STOP_MARKET requires trigger_price and parent_id".to_string(),
                    ));
                };

                self.lock_pending().insert(
                    order_id.clone(),
                    PendingStop {
                        symbol: order.symbol.clone(),
                        side: order.side,
                        size: order.size,
                        trigger_price,
                        parent_id,
                    },
                );
                tracing::debug!(
                    "Pending {:?} stop {} for {}: {:.6} @ {:.4}",
                    order.side,
                    order_id,
                    parent_id,
                    order.size,
                    trigger_price
                );

                Ok(FillResult {
                    order_id,
                    status: FillStatus::Pending,
                    filled_price: 0.0,
                    filled_size: 0.0,
                })
            }
            OrderKind::Market => {
                if self.reject_orders.load(Ordering::SeqCst) {
                    return Err(GatewayError::Denied("market orders disabled".to_string()));
                }
                let Some(price) = order.price.filter(|p| *p > 0.0) else {
                    return Err(GatewayError::Denied("market order needs a reference price".to_string()));
                };

                tracing::debug!(
                    "Filled {:?} market {} {:.6} @ {:.4}",
                    order.side,
                    order.symbol,
                    order.size,
                    price
                );
                self.record_fill(&order.symbol, order.side, order.size);
                Ok(FillResult {
                    order_id,
                    status: FillStatus::Filled,
                    filled_price: price,
                    filled_size: order.size,
                })
            }
        }
    }

    async fn cancel(&self, order_id: &str) -> GatewayResult<bool> {
        self.take_network_fault()?;

        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(GatewayError::Denied(format!("cancel of {order_id} refused")));
        }

        let removed = self.lock_pending().remove(order_id).is_some();
        if !removed {
            tracing::warn!("Cancel for {} ignored: not pending", order_id);
        }
        Ok(removed)
    }

    async fn close(
        &self,
        position_id: Uuid,
        side: Side,
        size: f64,
        symbol: &str,
        price: f64,
    ) -> GatewayResult<FillResult> {
        self.take_network_fault()?;

        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(GatewayError::Denied("close orders disabled".to_string()));
        }

        tracing::debug!(
            "Closing {:.6} {:?} of {} ({}) @ {:.4}",
            size,
            side,
            position_id,
            symbol,
            price
        );
        self.record_fill(symbol, side.opposite(), size);
        Ok(FillResult {
            order_id: format!("close-{position_id}"),
            status: FillStatus::Filled,
            filled_price: price,
            filled_size: size,
        })
    }

    async fn check_triggered_stops(&self, high: f64, low: f64) -> GatewayResult<Vec<TriggeredFill>> {
        self.take_network_fault()?;

        let mut pending = self.lock_pending();
        let fired: Vec<String> = pending
            .iter()
            .filter(|(_, stop)| match stop.side {
                Side::Long => high >= stop.trigger_price,
                Side::Short => low <= stop.trigger_price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut fills = Vec::with_capacity(fired.len());
        for trap_order_id in fired {
            let Some(stop) = pending.remove(&trap_order_id) else {
                continue;
            };
            tracing::warn!(
                "Trap {} for {} triggered at {:.4}",
                trap_order_id,
                stop.parent_id,
                stop.trigger_price
            );
            self.record_fill(&stop.symbol, stop.side, stop.size);
            fills.push(TriggeredFill {
                fill: FillResult {
                    order_id: format!("triggered-{trap_order_id}"),
                    status: FillStatus::Filled,
                    filled_price: stop.trigger_price,
                    filled_size: stop.size,
                },
                side: stop.side,
                parent_id: stop.parent_id,
                trap_order_id,
            });
        }

        Ok(fills)
    }
}
