//! Paper-trading gateway: simulates a single-symbol venue in memory
//!
//! Resting limit orders fill when [`PaperGateway::set_price`] moves the price
//! through them. Fills are pushed to every live fill subscription.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use super::errors::{GridError, GridResult};
use super::gateway::{ExchangeGateway, FillStream};
use super::types::{FillEvent, OrderId, OrderRequest, OrderSide, PositionState, RemoteOrder};

/// Paper position with average entry and realized PnL
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    /// Position size (positive = long, negative = short)
    pub size: f64,
    pub entry_price: f64,
    pub realized_pnl: f64,
}

impl PaperPosition {
    /// Update position after a fill
    fn apply_fill(&mut self, qty: f64, price: f64, side: OrderSide) {
        let signed_qty = side.sign() * qty;

        if self.size == 0.0 {
            self.size = signed_qty;
            self.entry_price = price;
        } else if self.size.signum() == signed_qty.signum() {
            // Adding to position
            let total_value = self.entry_price * self.size.abs() + price * qty;
            self.size += signed_qty;
            self.entry_price = total_value / self.size.abs();
        } else {
            // Reducing, closing or flipping
            let close_qty = qty.min(self.size.abs());
            self.realized_pnl += (price - self.entry_price) * close_qty * self.size.signum();
            let previous = self.size;
            self.size += signed_qty;

            if self.size.abs() < 1e-12 {
                self.size = 0.0;
                self.entry_price = 0.0;
            } else if previous.signum() != self.size.signum() {
                self.entry_price = price;
            }
        }
    }

    pub fn as_state(&self) -> PositionState {
        PositionState::new(self.size, self.entry_price)
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    remote: RemoteOrder,
    filled_qty: f64,
}

impl PaperOrder {
    fn remaining(&self) -> f64 {
        (self.remote.quantity - self.filled_qty).max(0.0)
    }

    /// Buy fills when price <= limit, sell when price >= limit
    fn crossed_by(&self, price: f64) -> bool {
        match self.remote.side {
            OrderSide::Buy => price <= self.remote.price,
            OrderSide::Sell => price >= self.remote.price,
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    price: f64,
    available_margin: f64,
    orders: BTreeMap<u64, PaperOrder>,
    position: PaperPosition,
    subscribers: Vec<mpsc::UnboundedSender<FillEvent>>,
    clock_ms: u64,
    placed: Vec<OrderRequest>,
    cancelled: Vec<OrderId>,
    closes: u32,
}

impl PaperBook {
    fn tick(&mut self) -> u64 {
        self.clock_ms += 1;
        self.clock_ms
    }

    fn fill(&mut self, oid: u64, qty: f64, price: f64) -> Option<FillEvent> {
        let order = self.orders.get_mut(&oid)?;
        let qty = qty.min(order.remaining());
        order.filled_qty += qty;
        let side = order.remote.side;
        let order_id = order.remote.order_id.clone();
        if order.remaining() <= 1e-12 {
            self.orders.remove(&oid);
        }

        self.position.apply_fill(qty, price, side);
        info!(
            "Paper fill: {} {} at {} (oid {}), position now {}",
            side.as_str(),
            qty,
            price,
            order_id,
            self.position.size
        );

        let event = FillEvent {
            order_id,
            filled_qty: qty,
            fill_price: price,
            timestamp: self.tick(),
        };
        self.broadcast(&event);
        Some(event)
    }

    fn broadcast(&mut self, event: &FillEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-memory venue used by tests and the paper-trading binary
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    next_oid: AtomicU64,
    should_fail: AtomicBool,
    reject_placements: AtomicBool,
}

impl PaperGateway {
    pub fn new(initial_price: f64, available_margin: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                price: initial_price,
                available_margin,
                ..Default::default()
            }),
            next_oid: AtomicU64::new(1),
            should_fail: AtomicBool::new(false),
            reject_placements: AtomicBool::new(false),
        }
    }

    /// Move the price and fill every order it crosses, at the order's limit
    pub async fn set_price(&self, price: f64) -> Vec<FillEvent> {
        let mut book = self.book.lock().await;
        book.price = price;

        let crossed: Vec<(u64, f64, f64)> = book
            .orders
            .iter()
            .filter(|(_, o)| o.crossed_by(price))
            .map(|(oid, o)| (*oid, o.remaining(), o.remote.price))
            .collect();

        crossed
            .into_iter()
            .filter_map(|(oid, qty, limit)| book.fill(oid, qty, limit))
            .collect()
    }

    /// Fill part of a resting order without moving the price
    pub async fn fill_order(&self, order_id: &str, qty: f64) -> Option<FillEvent> {
        let mut book = self.book.lock().await;
        let (oid, limit) = book
            .orders
            .iter()
            .find(|(_, o)| o.remote.order_id == order_id)
            .map(|(oid, o)| (*oid, o.remote.price))?;
        book.fill(oid, qty, limit)
    }

    /// Push an arbitrary event to subscribers (duplicate or late delivery)
    pub async fn emit_fill(&self, event: FillEvent) {
        self.book.lock().await.broadcast(&event);
    }

    /// Drop every fill subscription, ending the streams
    pub async fn disconnect_fills(&self) {
        self.book.lock().await.subscribers.clear();
    }

    pub async fn set_available_margin(&self, margin: f64) {
        self.book.lock().await.available_margin = margin;
    }

    pub async fn set_position(&self, size: f64, entry_price: f64) {
        let mut book = self.book.lock().await;
        let realized_pnl = book.position.realized_pnl;
        book.position = PaperPosition {
            size,
            entry_price,
            realized_pnl,
        };
    }

    /// Fail every call except fill subscription with a gateway error
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Reject placements as if the venue refused them
    pub fn set_reject_placements(&self, reject: bool) {
        self.reject_placements.store(reject, Ordering::SeqCst);
    }

    /// Rest an order that did not come through `place_order`
    pub async fn inject_order(
        &self,
        side: OrderSide,
        price: f64,
        quantity: f64,
        client_id: Option<String>,
    ) -> OrderId {
        let mut book = self.book.lock().await;
        let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let placed_at = book.tick();
        let order_id = format!("paper-{}", oid);
        book.orders.insert(
            oid,
            PaperOrder {
                remote: RemoteOrder {
                    order_id: order_id.clone(),
                    client_id,
                    side,
                    price,
                    quantity,
                    placed_at,
                },
                filled_qty: 0.0,
            },
        );
        order_id
    }

    /// Remove a resting order silently, as if the venue lost it
    pub async fn drop_order(&self, order_id: &str) -> bool {
        let mut book = self.book.lock().await;
        let before = book.orders.len();
        book.orders.retain(|_, o| o.remote.order_id != order_id);
        book.orders.len() != before
    }

    pub async fn price(&self) -> f64 {
        self.book.lock().await.price
    }

    pub async fn position(&self) -> PaperPosition {
        self.book.lock().await.position.clone()
    }

    pub async fn open_orders(&self) -> Vec<RemoteOrder> {
        self.book
            .lock()
            .await
            .orders
            .values()
            .map(|o| o.remote.clone())
            .collect()
    }

    /// Every request accepted by `place_order`, in order
    pub async fn placed_requests(&self) -> Vec<OrderRequest> {
        self.book.lock().await.placed.clone()
    }

    pub async fn cancelled_ids(&self) -> Vec<OrderId> {
        self.book.lock().await.cancelled.clone()
    }

    pub async fn close_count(&self) -> u32 {
        self.book.lock().await.closes
    }

    fn check_failure(&self, operation: &str) -> GridResult<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(GridError::Gateway(format!("paper {} unavailable", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn get_current_price(&self, _symbol: &str) -> GridResult<f64> {
        self.check_failure("get_current_price")?;
        Ok(self.book.lock().await.price)
    }

    async fn get_open_orders(&self, _symbol: &str) -> GridResult<Vec<RemoteOrder>> {
        self.check_failure("get_open_orders")?;
        Ok(self.open_orders().await)
    }

    async fn get_position(&self, _symbol: &str) -> GridResult<PositionState> {
        self.check_failure("get_position")?;
        Ok(self.book.lock().await.position.as_state())
    }

    async fn get_available_margin(&self, _asset: &str) -> GridResult<f64> {
        self.check_failure("get_available_margin")?;
        Ok(self.book.lock().await.available_margin)
    }

    async fn place_order(&self, symbol: &str, request: &OrderRequest) -> GridResult<OrderId> {
        self.check_failure("place_order")?;
        if self.reject_placements.load(Ordering::SeqCst) {
            return Err(GridError::Rejected("paper venue rejecting orders".into()));
        }

        let mut book = self.book.lock().await;

        let crosses = match request.side {
            OrderSide::Buy => request.price >= book.price,
            OrderSide::Sell => request.price <= book.price,
        };
        if request.post_only && crosses {
            return Err(GridError::Rejected(format!(
                "post-only {} @ {} would cross {}",
                request.side.as_str(),
                request.price,
                book.price
            )));
        }

        if request.reduce_only {
            let size = book.position.size;
            let reduces = match request.side {
                OrderSide::Buy => size < 0.0,
                OrderSide::Sell => size > 0.0,
            };
            if !reduces {
                return Err(GridError::Rejected(format!(
                    "reduce-only {} with position {}",
                    request.side.as_str(),
                    size
                )));
            }
        }

        let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("paper-{}", oid);
        let placed_at = book.tick();
        book.orders.insert(
            oid,
            PaperOrder {
                remote: RemoteOrder {
                    order_id: order_id.clone(),
                    client_id: request.client_id.clone(),
                    side: request.side,
                    price: request.price,
                    quantity: request.quantity,
                    placed_at,
                },
                filled_qty: 0.0,
            },
        );
        book.placed.push(request.clone());

        debug!(
            "Paper order {} {} {} {} @ {}",
            order_id,
            symbol,
            request.side.as_str(),
            request.quantity,
            request.price
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GridResult<()> {
        self.check_failure("cancel_order")?;
        let mut book = self.book.lock().await;
        let before = book.orders.len();
        book.orders.retain(|_, o| o.remote.order_id != order_id);
        if book.orders.len() == before {
            return Err(GridError::OrderNotFound(order_id.to_string()));
        }
        book.cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn cancel_all(&self, _symbol: &str) -> GridResult<usize> {
        self.check_failure("cancel_all")?;
        let mut book = self.book.lock().await;
        let ids: Vec<OrderId> = book
            .orders
            .values()
            .map(|o| o.remote.order_id.clone())
            .collect();
        book.orders.clear();
        let count = ids.len();
        book.cancelled.extend(ids);
        Ok(count)
    }

    async fn close_position_market(&self, symbol: &str) -> GridResult<()> {
        self.check_failure("close_position_market")?;
        let mut book = self.book.lock().await;
        let size = book.position.size;
        let price = book.price;
        if size != 0.0 {
            let side = if size > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            book.position.apply_fill(size.abs(), price, side);
            info!("Paper close {}: {} {} at {}", symbol, side.as_str(), size.abs(), price);
        }
        book.closes += 1;
        Ok(())
    }

    async fn subscribe_fills(&self, _symbol: &str) -> GridResult<FillStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.book.lock().await.subscribers.push(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
