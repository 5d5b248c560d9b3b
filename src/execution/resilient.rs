use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use rand::Rng;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::execution::gateway::{
    FillResult, GatewayError, GatewayResult, OrderGateway, OrderRequest, TriggeredFill,
};
use crate::models::Side;

type GatewayRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Backoff schedule for network faults
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl From<&GatewayConfig> for RetryPolicy {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff clamped to `max_delay_ms`, with +/- jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Rate-limited, retrying wrapper around any gateway.
///
/// Only network faults are retried; denials pass straight through. Once the budget
/// is spent the last network fault is returned and the caller abandons the tick.
pub struct ResilientGateway<G> {
    inner: G,
    policy: RetryPolicy,
    rate_limiter: Arc<GatewayRateLimiter>,
}

impl<G: OrderGateway> ResilientGateway<G> {
    pub fn new(inner: G, config: &GatewayConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner,
            policy: RetryPolicy::from(config),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            self.rate_limiter.until_ready().await;

            match call().await {
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        operation,
                        attempt + 1,
                        self.policy.max_retries + 1,
                        err,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::error!("{} gave up after {} attempts: {}", operation, attempt + 1, err);
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<G: OrderGateway> OrderGateway for ResilientGateway<G> {
    async fn place(&self, order: OrderRequest) -> GatewayResult<FillResult> {
        self.with_retry("place", || self.inner.place(order.clone())).await
    }

    async fn cancel(&self, order_id: &str) -> GatewayResult<bool> {
        self.with_retry("cancel", || self.inner.cancel(order_id)).await
    }

    async fn close(
        &self,
        position_id: Uuid,
        side: Side,
        size: f64,
        symbol: &str,
        price: f64,
    ) -> GatewayResult<FillResult> {
        self.with_retry("close", || self.inner.close(position_id, side, size, symbol, price))
            .await
    }

    async fn check_triggered_stops(&self, high: f64, low: f64) -> GatewayResult<Vec<TriggeredFill>> {
        self.with_retry("check_triggered_stops", || {
            self.inner.check_triggered_stops(high, low)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SimulatedGateway;

    fn fast_config(max_retries: u32) -> GatewayConfig {
        GatewayConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
            requests_per_second: 1_000,
        }
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
    }

    #[tokio::test]
    async fn test_network_faults_retried_until_success() {
        let gateway = ResilientGateway::new(SimulatedGateway::new(), &fast_config(3));
        gateway.inner().inject_network_failures(2);

        let fill = gateway
            .place(OrderRequest::market("BTC/USDT", Side::Long, 1.0, 100.0))
            .await;
        assert!(fill.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_budget_surfaces_network_fault() {
        let gateway = ResilientGateway::new(SimulatedGateway::new(), &fast_config(1));
        gateway.inner().inject_network_failures(5);

        let result = gateway.cancel("sim-1").await;
        assert!(matches!(result, Err(GatewayError::Network(_))));
        // two attempts consumed, three faults remain
        gateway.inner().inject_network_failures(0);
        assert_eq!(gateway.cancel("sim-1").await, Ok(false));
    }

    #[tokio::test]
    async fn test_denials_not_retried() {
        let gateway = ResilientGateway::new(SimulatedGateway::new(), &fast_config(3));
        gateway.inner().set_reject_orders(true);
        gateway.inner().inject_network_failures(0);

        let result = gateway
            .place(OrderRequest::market("BTC/USDT", Side::Long, 1.0, 100.0))
            .await;
        assert!(matches!(result, Err(GatewayError::Denied(_))));
    }
}
