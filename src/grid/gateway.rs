//! Exchange abstraction for the grid engine, plus timeout/retry call policy

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::warn;

use super::config::EngineSettings;
use super::errors::{GridError, GridResult};
use super::types::{FillEvent, OrderId, OrderRequest, PositionState, RemoteOrder};

/// Push stream of fills for one symbol; ends when the venue drops the subscription
pub type FillStream = BoxStream<'static, FillEvent>;

/// Venue operations the engine needs - implemented by real adapters and by
/// [`PaperGateway`](super::paper::PaperGateway) for tests
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Last traded or mid price
    async fn get_current_price(&self, symbol: &str) -> GridResult<f64>;

    /// All resting orders for the symbol, including ones this engine did not place
    async fn get_open_orders(&self, symbol: &str) -> GridResult<Vec<RemoteOrder>>;

    async fn get_position(&self, symbol: &str) -> GridResult<PositionState>;

    /// Free margin in the given asset
    async fn get_available_margin(&self, asset: &str) -> GridResult<f64>;

    /// Place a limit order; returns the exchange order id
    async fn place_order(&self, symbol: &str, request: &OrderRequest) -> GridResult<OrderId>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GridResult<()>;

    /// Cancel every resting order for the symbol; returns how many were cancelled
    async fn cancel_all(&self, symbol: &str) -> GridResult<usize>;

    /// Flatten the position with a market order
    async fn close_position_market(&self, symbol: &str) -> GridResult<()>;

    async fn subscribe_fills(&self, symbol: &str) -> GridResult<FillStream>;
}

/// Backoff stops doubling after this many attempts
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Bounded timeout and exponential backoff around gateway calls
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    timeout: Duration,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl CallPolicy {
    pub fn new(timeout: Duration, max_retries: u32, retry_base_delay_ms: u64) -> Self {
        Self {
            timeout,
            max_retries: max_retries.max(1),
            retry_base_delay_ms,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.call_timeout(),
            settings.max_retries,
            settings.retry_base_delay_ms,
        )
    }

    /// Run one attempt, failing with `Timeout` if it exceeds the bound
    pub async fn once<T, Fut>(&self, operation: &str, fut: Fut) -> GridResult<T>
    where
        Fut: Future<Output = GridResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GridError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Wait before the retry that follows failed attempt number `attempt`
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Execute with per-attempt timeout and exponential backoff retry
    ///
    /// Only transient errors are retried; anything else is returned as is.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> GridResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        let mut attempts = 0;

        loop {
            match self.once(operation, f()).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempts += 1;

                    if attempts >= self.max_retries {
                        return Err(GridError::RetriesExhausted {
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    let delay = self.backoff_delay(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempts, self.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}
