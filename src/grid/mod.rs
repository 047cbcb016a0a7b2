//! Grid Trading Engine
//!
//! Turns a price range and a level count into a standing ladder of limit
//! orders, keeps that ladder consistent with the venue as fills and price
//! movement occur, and moves the range while running.
//!
//! # Architecture
//!
//! - [`model`] - price ladder (arithmetic or geometric spacing)
//! - [`risk`] - margin check, stop-loss / take-profit, position limits
//! - [`ledger`] - local view of which level holds which order
//! - [`gateway`] - exchange abstraction plus timeout / retry policy
//! - [`paper`] - in-memory venue for tests and paper trading
//! - [`boundary`] - breach detection and recentering
//! - [`reconcile`] - periodic snapshot / diff / act pass
//! - [`fills`] - fill listener and mirror orders
//! - [`adjuster`] - live range adjustment
//! - [`engine`] - the [`Engine`] handle, state machine and engine-wide lock
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grid_engine::grid::{BoundaryAction, Engine, EngineSettings, GridConfig, PaperGateway};
//!
//! let gateway = Arc::new(PaperGateway::new(111.0, 10_000.0));
//!
//! // 5 levels between 100 and 120, 1.0 per order, at most 3.0 net
//! let config = GridConfig::new("SOL_USDC_PERP", 100.0, 120.0, 5, 1.0, 3.0)
//!     .with_leverage(5)
//!     .with_boundary(0.01, BoundaryAction::EmergencyClose);
//!
//! let engine = Engine::start(gateway, config, EngineSettings::default()).await?;
//! engine.adjust_range(Some(95.0), None).await?;
//! println!("{}", engine.status().await.to_json()?);
//! engine.stop().await?;
//! ```

pub mod adjuster;
pub mod boundary;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fills;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod paper;
pub mod reconcile;
pub mod risk;
pub mod types;

// Re-export commonly used types
pub use boundary::{Breach, BreachDirection, BoundaryMonitor};
pub use config::{BoundaryAction, EngineSettings, GridConfig, GridMode, SpacingMode, MAX_LEVEL_COUNT};
pub use engine::Engine;
pub use errors::{GridError, GridResult};
pub use gateway::{CallPolicy, ExchangeGateway, FillStream};
pub use ledger::{FillOutcome, OrderLedger};
pub use model::GridLadder;
pub use paper::{PaperGateway, PaperPosition};
pub use reconcile::PassOutcome;
pub use risk::{PositionRisk, RiskGuard, MARGIN_BUFFER};
pub use types::{
    Action, EngineState, EngineStatus, FillEvent, GridLevel, GridOrder, HaltReason, LevelView,
    OrderId, OrderRequest, OrderSide, OrderStatus, PositionState, RemoteOrder, RemoteSnapshot,
};
