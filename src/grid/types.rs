//! Core data types for the grid engine

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::GridConfig;
use super::errors::GridResult;

/// Exchange-assigned order identifier
pub type OrderId = String;

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// One price point of the ladder; immutable once the ladder is built
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Index of this level (0 = lowest price)
    pub index: u32,
    /// Price at this level
    pub price: f64,
}

/// Lifecycle of a grid order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Level needs coverage, no acknowledged exchange order yet
    Pending,
    /// Resting on the exchange
    Open,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

/// Order owned by the ledger for one grid level
#[derive(Debug, Clone)]
pub struct GridOrder {
    pub level_index: u32,
    /// `None` means "should be placed but isn't yet"
    pub exchange_order_id: Option<OrderId>,
    /// Client id of the latest placement attempt
    pub client_id: Option<String>,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: OrderStatus,
    /// Placement requested and not yet resolved
    pub(crate) in_flight: bool,
    pub(crate) acknowledged_at: Option<Instant>,
    /// Consecutive snapshots taken after acknowledgement that did not list it
    pub(crate) missed_snapshots: u32,
}

impl GridOrder {
    /// Create a pending order for a level
    pub fn pending(level: &GridLevel, side: OrderSide, quantity: f64) -> Self {
        Self {
            level_index: level.index,
            exchange_order_id: None,
            client_id: None,
            side,
            price: level.price,
            quantity,
            filled_quantity: 0.0,
            status: OrderStatus::Pending,
            in_flight: false,
            acknowledged_at: None,
            missed_snapshots: 0,
        }
    }

    /// Placement was requested under `client_id`
    pub fn mark_submitted(&mut self, client_id: String) {
        self.client_id = Some(client_id);
        self.in_flight = true;
    }

    /// Exchange acknowledged the placement
    pub fn mark_open(&mut self, order_id: OrderId) {
        self.exchange_order_id = Some(order_id);
        self.status = OrderStatus::Open;
        self.in_flight = false;
        self.acknowledged_at = Some(Instant::now());
    }

    /// Placement failed; the order stays pending for the next pass
    pub fn mark_submit_failed(&mut self) {
        self.in_flight = false;
    }

    /// Accumulate a fill; returns true once the order is completely filled
    pub fn apply_fill(&mut self, qty: f64) -> bool {
        self.filled_quantity += qty;
        if self.filled_quantity >= self.quantity * (1.0 - 1e-9) {
            self.status = OrderStatus::Filled;
            self.in_flight = false;
            true
        } else {
            false
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OrderStatus::Cancelled;
        self.in_flight = false;
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }
}

/// Open order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Placement time in milliseconds since epoch
    pub placed_at: u64,
}

/// Net position as reported by the exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Signed size (positive = long, negative = short)
    pub size: f64,
    /// Average entry price (0 when flat)
    pub entry_price: f64,
}

impl PositionState {
    pub fn new(size: f64, entry_price: f64) -> Self {
        Self { size, entry_price }
    }

    pub fn is_flat(&self) -> bool {
        self.size.abs() < 1e-12
    }

    /// Unrealized PnL at `current_price`
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        (current_price - self.entry_price) * self.size
    }
}

/// Fill notification pushed by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub filled_qty: f64,
    pub fill_price: f64,
    /// Milliseconds since epoch
    pub timestamp: u64,
}

/// Order placement request handed to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_id: Option<String>,
}

impl OrderRequest {
    pub fn new(side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            side,
            price,
            quantity,
            post_only: false,
            reduce_only: false,
            client_id: None,
        }
    }

    pub fn post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }

    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Corrective step emitted by the ledger; executing it is the engine's job
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Place {
        level_index: u32,
        side: OrderSide,
        price: f64,
        quantity: f64,
        reduce_only: bool,
        client_id: String,
    },
    Cancel {
        order_id: OrderId,
    },
}

impl Action {
    pub fn is_place(&self) -> bool {
        matches!(self, Action::Place { .. })
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Action::Cancel { .. })
    }
}

/// Exchange state fetched at the start of a reconciliation pass
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub price: f64,
    pub open_orders: Vec<RemoteOrder>,
    pub position: PositionState,
    /// When the open-order fetch started
    pub taken_at: Instant,
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Starting,
    Running,
    AdjustingRange,
    Halting,
    Stopped,
}

impl EngineState {
    /// Allowed state machine edges
    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Halting)
                | (Starting, Stopped)
                | (Running, AdjustingRange)
                | (Running, Halting)
                | (AdjustingRange, Running)
                | (AdjustingRange, Halting)
                | (Halting, Stopped)
        )
    }

    /// Orders may be placed in this state
    pub fn is_live(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::AdjustingRange)
    }
}

/// Why the engine halted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HaltReason {
    StopRequested,
    BoundaryBreach { price: f64, limit: f64 },
    StopLoss { unrealized_pnl: f64 },
    TakeProfit { unrealized_pnl: f64 },
}

/// Per-level view exposed through [`EngineStatus`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelView {
    pub index: u32,
    pub price: f64,
    /// Side the level should be covered with, if any
    pub desired_side: Option<OrderSide>,
    pub order_status: Option<OrderStatus>,
    pub order_id: Option<OrderId>,
}

/// Snapshot returned by `Engine::status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub run_id: String,
    pub epoch_id: u64,
    pub state: EngineState,
    pub config: GridConfig,
    pub current_levels: Vec<LevelView>,
    pub position: PositionState,
    pub last_price: Option<f64>,
    pub last_reconcile_time: Option<DateTime<Utc>>,
    /// Set while reconciliation keeps failing
    pub stale_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub open_orders: usize,
    pub halt_reason: Option<HaltReason>,
}

impl EngineStatus {
    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }

    pub fn to_json(&self) -> GridResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
