//! Exchange capability boundary
//!
//! The engine consumes the exchange through the [`Exchange`] trait: order
//! placement and cancellation, instrument metadata, market data snapshots,
//! and the two live event streams (depth, trades). Transport, REST details
//! and authentication live behind this trait in a separate connector; the
//! crate ships [`sim::SimExchange`], a deterministic implementation used by
//! the test suite and by sandbox/self-test runs.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::feed::{DepthEvent, TradeEvent};
use crate::types::{OrderSide, Position};
use crate::volatility::Bar;

/// Instrument trading rules fetched at startup
#[derive(Debug, Clone, Copy)]
pub struct InstrumentRules {
    /// Minimum price increment
    pub tick_size: f64,
    /// Minimum quantity increment
    pub step_size: f64,
    /// Minimum order quantity
    pub min_qty: f64,
}

/// Time-in-force for limit orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeInForce {
    /// Good-til-cancelled (resting grid orders)
    #[default]
    Gtc,
    /// Immediate-or-cancel
    Ioc,
}

/// A limit order submission
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Client-assigned id, echoed back by the exchange
    pub client_id: Uuid,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn new(side: OrderSide, price: f64, qty: f64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            side,
            price,
            qty,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
        }
    }

    /// Set reduce_only flag (used for position-closing orders)
    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }
}

/// An open order as reported by the exchange
#[derive(Debug, Clone)]
pub struct OpenOrderInfo {
    pub oid: u64,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
}

/// Order state as reported by the exchange on a status query
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOrderStatus {
    Open,
    Filled { avg_price: f64 },
    Cancelled,
    Rejected,
    /// The exchange no longer knows this order
    Unknown,
}

/// Exchange operations consumed by the engine
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Fetch tick size, step size, and minimum quantity for a symbol
    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules>;

    /// Set leverage for a symbol
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Current mark price
    async fn mark_price(&self, symbol: &str) -> Result<f64>;

    /// Most recent price bars for the given interval (e.g. "1m"), oldest
    /// first
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Bar>>;

    /// Place a limit order; returns the exchange-assigned order id
    async fn place_order(&self, symbol: &str, request: &OrderRequest) -> Result<u64>;

    /// Cancel an order by id; a no-op for orders already terminal
    async fn cancel_order(&self, symbol: &str, oid: u64) -> Result<()>;

    /// All currently resting orders for a symbol
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderInfo>>;

    /// Query the state of a specific order
    async fn query_order(&self, symbol: &str, oid: u64) -> Result<ExchangeOrderStatus>;

    /// Current position for a symbol
    async fn position(&self, symbol: &str) -> Result<Position>;

    /// Subscribe to order-book depth updates
    async fn subscribe_depth(&self, symbol: &str) -> Result<mpsc::UnboundedReceiver<DepthEvent>>;

    /// Subscribe to trade ticks
    async fn subscribe_trades(&self, symbol: &str) -> Result<mpsc::UnboundedReceiver<TradeEvent>>;
}

/// Execute an exchange call with exponential backoff.
///
/// Only transient (connectivity) errors are retried; anything else is
/// returned immediately.
pub async fn with_retry<T, F, Fut>(max_retries: u32, base_delay_ms: u64, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut last_error = Error::Connectivity("no attempts made".into());

    while attempts < max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                attempts += 1;
                last_error = e;

                if attempts < max_retries {
                    let delay = base_delay_ms * 2u64.pow(attempts - 1);
                    warn!(
                        "Exchange call failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_retries, delay, last_error
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::RetriesExhausted {
        attempts: max_retries,
        reason: last_error.to_string(),
    })
}

// ============================================================================
// Deterministic simulator
// ============================================================================

/// Deterministic exchange used by the test suite and sandbox runs.
pub mod sim {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    struct SimOrder {
        info: OpenOrderInfo,
        status: ExchangeOrderStatus,
    }

    /// Deterministic in-memory exchange
    ///
    /// Orders rest until a test (or the sandbox driver) fills or cancels
    /// them explicitly; nothing fills on its own.
    pub struct SimExchange {
        pub rules: InstrumentRules,
        pub mark_price: Arc<Mutex<f64>>,
        pub bars: Arc<Mutex<Vec<Bar>>>,
        pub leverage: Arc<Mutex<Option<u32>>>,
        pub position: Arc<Mutex<Position>>,
        orders: Arc<Mutex<HashMap<u64, SimOrder>>>,
        next_oid: AtomicU64,
        /// When set, order placement fails with a connectivity error
        pub fail_placements: Arc<Mutex<bool>>,
        /// When set, the next placement is accepted then immediately rejected
        pub reject_next: Arc<Mutex<bool>>,
        depth_tx: Arc<Mutex<Option<mpsc::UnboundedSender<DepthEvent>>>>,
        trade_tx: Arc<Mutex<Option<mpsc::UnboundedSender<TradeEvent>>>>,
    }

    impl SimExchange {
        pub fn new(mark_price: f64) -> Self {
            Self {
                rules: InstrumentRules {
                    tick_size: 0.1,
                    step_size: 0.001,
                    min_qty: 0.001,
                },
                mark_price: Arc::new(Mutex::new(mark_price)),
                bars: Arc::new(Mutex::new(Vec::new())),
                leverage: Arc::new(Mutex::new(None)),
                position: Arc::new(Mutex::new(Position::flat())),
                orders: Arc::new(Mutex::new(HashMap::new())),
                next_oid: AtomicU64::new(1),
                fail_placements: Arc::new(Mutex::new(false)),
                reject_next: Arc::new(Mutex::new(false)),
                depth_tx: Arc::new(Mutex::new(None)),
                trade_tx: Arc::new(Mutex::new(None)),
            }
        }

        pub fn with_rules(mut self, rules: InstrumentRules) -> Self {
            self.rules = rules;
            self
        }

        pub async fn set_mark_price(&self, price: f64) {
            *self.mark_price.lock().await = price;
        }

        pub async fn set_bars(&self, bars: Vec<Bar>) {
            *self.bars.lock().await = bars;
        }

        pub async fn set_fail_placements(&self, fail: bool) {
            *self.fail_placements.lock().await = fail;
        }

        pub async fn set_reject_next(&self, reject: bool) {
            *self.reject_next.lock().await = reject;
        }

        /// Mark a resting order as filled at the given price and update the
        /// simulated position accordingly.
        pub async fn fill_order(&self, oid: u64, price: f64) -> Result<()> {
            let mut orders = self.orders.lock().await;
            let order = orders.get_mut(&oid).ok_or(Error::OrderNotFound { oid })?;

            if order.status != ExchangeOrderStatus::Open {
                return Err(Error::InvalidOrderParams(format!(
                    "order {oid} is not open"
                )));
            }

            order.status = ExchangeOrderStatus::Filled { avg_price: price };
            let (side, qty) = (order.info.side, order.info.qty);
            drop(orders);

            self.position.lock().await.apply_fill(side, qty, price);
            Ok(())
        }

        /// Fill every open order whose limit price is crossed by `price`
        /// (buys at or above the trade price, sells at or below it).
        /// Returns the filled order ids.
        pub async fn fill_crossed(&self, price: f64) -> Vec<u64> {
            let crossed: Vec<u64> = {
                let orders = self.orders.lock().await;
                orders
                    .values()
                    .filter(|o| o.status == ExchangeOrderStatus::Open)
                    .filter(|o| match o.info.side {
                        OrderSide::Buy => price <= o.info.price,
                        OrderSide::Sell => price >= o.info.price,
                    })
                    .map(|o| o.info.oid)
                    .collect()
            };

            for &oid in &crossed {
                let fill_price = {
                    let orders = self.orders.lock().await;
                    orders.get(&oid).map(|o| o.info.price)
                };
                if let Some(fill_price) = fill_price {
                    let _ = self.fill_order(oid, fill_price).await;
                }
            }

            crossed
        }

        /// Cancel an order out from under the engine (exchange-initiated)
        pub async fn cancel_order_externally(&self, oid: u64) -> Result<()> {
            let mut orders = self.orders.lock().await;
            let order = orders.get_mut(&oid).ok_or(Error::OrderNotFound { oid })?;
            order.status = ExchangeOrderStatus::Cancelled;
            Ok(())
        }

        pub async fn open_order_count(&self) -> usize {
            self.orders
                .lock()
                .await
                .values()
                .filter(|o| o.status == ExchangeOrderStatus::Open)
                .count()
        }

        pub async fn push_depth(&self, event: DepthEvent) -> bool {
            match self.depth_tx.lock().await.as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        pub async fn push_trade(&self, event: TradeEvent) -> bool {
            match self.trade_tx.lock().await.as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        /// Drop the depth stream sender, simulating a disconnect
        pub async fn drop_depth_stream(&self) {
            *self.depth_tx.lock().await = None;
        }
    }

    #[async_trait]
    impl Exchange for SimExchange {
        async fn instrument_rules(&self, _symbol: &str) -> Result<InstrumentRules> {
            Ok(self.rules)
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<()> {
            *self.leverage.lock().await = Some(leverage);
            Ok(())
        }

        async fn mark_price(&self, _symbol: &str) -> Result<f64> {
            Ok(*self.mark_price.lock().await)
        }

        async fn klines(&self, _symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Bar>> {
            let bars = self.bars.lock().await;
            let start = bars.len().saturating_sub(limit);
            Ok(bars[start..].to_vec())
        }

        async fn place_order(&self, _symbol: &str, request: &OrderRequest) -> Result<u64> {
            if *self.fail_placements.lock().await {
                return Err(Error::Connectivity("simulated outage".into()));
            }

            if request.qty < self.rules.min_qty {
                return Err(Error::InvalidOrderParams(format!(
                    "qty {} below minimum {}",
                    request.qty, self.rules.min_qty
                )));
            }

            let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
            let rejected = {
                let mut reject = self.reject_next.lock().await;
                std::mem::take(&mut *reject)
            };

            self.orders.lock().await.insert(
                oid,
                SimOrder {
                    info: OpenOrderInfo {
                        oid,
                        side: request.side,
                        price: request.price,
                        qty: request.qty,
                    },
                    status: if rejected {
                        ExchangeOrderStatus::Rejected
                    } else {
                        ExchangeOrderStatus::Open
                    },
                },
            );

            Ok(oid)
        }

        async fn cancel_order(&self, _symbol: &str, oid: u64) -> Result<()> {
            let mut orders = self.orders.lock().await;
            if let Some(order) = orders.get_mut(&oid) {
                if order.status == ExchangeOrderStatus::Open {
                    order.status = ExchangeOrderStatus::Cancelled;
                }
            }
            Ok(())
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrderInfo>> {
            Ok(self
                .orders
                .lock()
                .await
                .values()
                .filter(|o| o.status == ExchangeOrderStatus::Open)
                .map(|o| o.info.clone())
                .collect())
        }

        async fn query_order(&self, _symbol: &str, oid: u64) -> Result<ExchangeOrderStatus> {
            Ok(self
                .orders
                .lock()
                .await
                .get(&oid)
                .map(|o| o.status.clone())
                .unwrap_or(ExchangeOrderStatus::Unknown))
        }

        async fn position(&self, _symbol: &str) -> Result<Position> {
            Ok(*self.position.lock().await)
        }

        async fn subscribe_depth(
            &self,
            _symbol: &str,
        ) -> Result<mpsc::UnboundedReceiver<DepthEvent>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.depth_tx.lock().await = Some(tx);
            Ok(rx)
        }

        async fn subscribe_trades(
            &self,
            _symbol: &str,
        ) -> Result<mpsc::UnboundedReceiver<TradeEvent>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.trade_tx.lock().await = Some(tx);
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimExchange;
    use super::*;

    #[tokio::test]
    async fn test_sim_place_and_query() {
        let exchange = SimExchange::new(50000.0);

        let request = OrderRequest::new(OrderSide::Buy, 49900.0, 0.01);
        let oid = exchange.place_order("BTCUSDT", &request).await.unwrap();

        assert_eq!(
            exchange.query_order("BTCUSDT", oid).await.unwrap(),
            ExchangeOrderStatus::Open
        );
        assert_eq!(exchange.open_orders("BTCUSDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sim_fill_updates_position() {
        let exchange = SimExchange::new(50000.0);

        let request = OrderRequest::new(OrderSide::Buy, 49900.0, 0.01);
        let oid = exchange.place_order("BTCUSDT", &request).await.unwrap();
        exchange.fill_order(oid, 49900.0).await.unwrap();

        let position = exchange.position("BTCUSDT").await.unwrap();
        assert_eq!(position.entry_price, Some(49900.0));
        assert!((position.size - 0.01).abs() < 1e-9);

        match exchange.query_order("BTCUSDT", oid).await.unwrap() {
            ExchangeOrderStatus::Filled { avg_price } => {
                assert!((avg_price - 49900.0).abs() < 1e-9)
            }
            other => panic!("expected Filled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sim_rejects_below_min_qty() {
        let exchange = SimExchange::new(50000.0);

        let request = OrderRequest::new(OrderSide::Buy, 49900.0, 0.0001);
        let result = exchange.place_order("BTCUSDT", &request).await;
        assert!(matches!(result, Err(Error::InvalidOrderParams(_))));
    }

    #[tokio::test]
    async fn test_sim_query_unknown_order() {
        let exchange = SimExchange::new(50000.0);
        assert_eq!(
            exchange.query_order("BTCUSDT", 999).await.unwrap(),
            ExchangeOrderStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_transient_failure() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result = with_retry(5, 1, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Connectivity("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_budget() {
        let result: Result<()> = with_retry(3, 1, || async {
            Err(Error::Connectivity("down".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_invalid_params() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(5, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InvalidOrderParams("bad qty".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidOrderParams(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
