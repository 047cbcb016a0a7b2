//! Grid engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Upper limit on ladder size (200 grid intervals)
pub const MAX_LEVEL_COUNT: u32 = 201;

/// Grid spacing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpacingMode {
    /// Uniform price spacing (e.g., $100, $105, $110)
    #[default]
    Arithmetic,
    /// Percentage-based spacing (e.g., +5%, +5%, +5%)
    Geometric,
}

/// Which directions the grid is allowed to open positions in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    /// Buys below the reference level, sells above it
    #[default]
    Neutral,
    /// Only buys open positions; sells exist solely to close them
    LongOnly,
    /// Only sells open positions; buys exist solely to close them
    ShortOnly,
}

/// Reaction when price leaves the configured range beyond tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryAction {
    /// Cancel all orders, market-close the position, halt
    EmergencyClose,
    /// Recenter the grid on the current price
    AutoAdjust,
    /// Cancel all orders, keep the position, halt
    #[default]
    HaltOnly,
}

/// Grid configuration for one epoch
///
/// Immutable while an epoch is live. A range adjustment produces a new value
/// through [`GridConfig::with_bounds`] rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Symbol to trade (e.g., "SOL_USDC_PERP")
    pub symbol: String,

    /// Asset the margin is held in (e.g., "USDC")
    #[serde(default = "default_margin_asset")]
    pub margin_asset: String,

    /// Lower price boundary for the grid
    pub lower_bound: f64,

    /// Upper price boundary for the grid
    pub upper_bound: f64,

    /// Number of price levels, both bounds included
    pub level_count: u32,

    #[serde(default)]
    pub spacing_mode: SpacingMode,

    #[serde(default)]
    pub grid_mode: GridMode,

    /// Base quantity of every grid order
    pub order_quantity: f64,

    /// Largest absolute net position the grid may build
    pub max_position: f64,

    /// Leverage applied by the venue (1-125)
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Fractional slack beyond the bounds before a breach is declared
    #[serde(default = "default_boundary_tolerance")]
    pub boundary_tolerance: f64,

    #[serde(default)]
    pub boundary_action: BoundaryAction,

    /// Place grid orders as maker-only
    #[serde(default = "default_post_only")]
    pub post_only: bool,

    /// Unrealized PnL (quote currency, negative) that triggers an emergency close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,

    /// Unrealized PnL (quote currency, positive) that triggers an emergency close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

fn default_margin_asset() -> String {
    "USDC".to_string()
}

fn default_leverage() -> u32 {
    1
}

fn default_boundary_tolerance() -> f64 {
    0.01
}

fn default_post_only() -> bool {
    true
}

impl GridConfig {
    /// Create a new grid configuration with required parameters
    ///
    /// # Arguments
    /// * `symbol` - Symbol to trade
    /// * `lower_bound` - Lower price boundary
    /// * `upper_bound` - Upper price boundary
    /// * `level_count` - Number of price levels including both bounds
    /// * `order_quantity` - Base quantity per grid order
    /// * `max_position` - Absolute position cap
    pub fn new(
        symbol: impl Into<String>,
        lower_bound: f64,
        upper_bound: f64,
        level_count: u32,
        order_quantity: f64,
        max_position: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            margin_asset: default_margin_asset(),
            lower_bound,
            upper_bound,
            level_count,
            spacing_mode: SpacingMode::default(),
            grid_mode: GridMode::default(),
            order_quantity,
            max_position,
            leverage: default_leverage(),
            boundary_tolerance: default_boundary_tolerance(),
            boundary_action: BoundaryAction::default(),
            post_only: default_post_only(),
            stop_loss: None,
            take_profit: None,
        }
    }

    /// Builder: set spacing mode
    pub fn with_spacing(mut self, spacing: SpacingMode) -> Self {
        self.spacing_mode = spacing;
        self
    }

    /// Builder: set grid mode
    pub fn with_grid_mode(mut self, mode: GridMode) -> Self {
        self.grid_mode = mode;
        self
    }

    /// Builder: set leverage
    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    /// Builder: set boundary tolerance and breach reaction
    pub fn with_boundary(mut self, tolerance: f64, action: BoundaryAction) -> Self {
        self.boundary_tolerance = tolerance;
        self.boundary_action = action;
        self
    }

    /// Builder: set margin asset
    pub fn with_margin_asset(mut self, asset: impl Into<String>) -> Self {
        self.margin_asset = asset.into();
        self
    }

    /// Builder: set maker-only placement
    pub fn with_post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }

    /// Builder: set stop-loss threshold (unrealized PnL, negative)
    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    /// Builder: set take-profit threshold (unrealized PnL, positive)
    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    /// Copy of this config with new bounds; `None` keeps the current bound
    pub fn with_bounds(&self, lower: Option<f64>, upper: Option<f64>) -> Self {
        let mut next = self.clone();
        if let Some(lower) = lower {
            next.lower_bound = lower;
        }
        if let Some(upper) = upper {
            next.upper_bound = upper;
        }
        next
    }

    /// Validate the range part of the configuration
    pub fn validate_range(&self) -> GridResult<()> {
        if !self.lower_bound.is_finite() || !self.upper_bound.is_finite() {
            return Err(GridError::InvalidRange("bounds must be finite".into()));
        }

        if self.lower_bound <= 0.0 || self.upper_bound <= 0.0 {
            return Err(GridError::InvalidRange(format!(
                "bounds must be positive, got [{}, {}]",
                self.lower_bound, self.upper_bound
            )));
        }

        if self.upper_bound <= self.lower_bound {
            return Err(GridError::InvalidRange(format!(
                "upper_bound {} must be greater than lower_bound {}",
                self.upper_bound, self.lower_bound
            )));
        }

        if self.level_count < 2 {
            return Err(GridError::InvalidRange(format!(
                "level_count must be at least 2, got {}",
                self.level_count
            )));
        }

        Ok(())
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> GridResult<()> {
        self.validate_range()?;

        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.level_count > MAX_LEVEL_COUNT {
            return Err(GridError::InvalidConfig(format!(
                "level_count must be at most {}",
                MAX_LEVEL_COUNT
            )));
        }

        if !(self.order_quantity > 0.0) {
            return Err(GridError::InvalidConfig(
                "order_quantity must be positive".into(),
            ));
        }

        if !(self.max_position > 0.0) {
            return Err(GridError::InvalidConfig(
                "max_position must be positive".into(),
            ));
        }

        if self.order_quantity > self.max_position {
            return Err(GridError::InvalidConfig(format!(
                "order_quantity {} exceeds max_position {}",
                self.order_quantity, self.max_position
            )));
        }

        if self.leverage == 0 || self.leverage > 125 {
            return Err(GridError::InvalidConfig(
                "leverage must be between 1 and 125".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.boundary_tolerance) {
            return Err(GridError::InvalidConfig(
                "boundary_tolerance must be in [0.0, 1.0)".into(),
            ));
        }

        if let Some(stop_loss) = self.stop_loss {
            if stop_loss >= 0.0 {
                return Err(GridError::InvalidConfig("stop_loss must be negative".into()));
            }
        }

        if let Some(take_profit) = self.take_profit {
            if take_profit <= 0.0 {
                return Err(GridError::InvalidConfig(
                    "take_profit must be positive".into(),
                ));
            }
        }

        Ok(())
    }

    /// Width of the range in price units
    pub fn width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to JSON file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> GridResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Runtime knobs of the engine, independent of the grid epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Seconds between reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Upper bound on any single gateway call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Attempts per snapshot fetch before the pass is skipped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Pause before re-subscribing to an ended fill stream
    #[serde(default = "default_resubscribe_delay")]
    pub fill_resubscribe_delay_ms: u64,

    /// Market-close the position on an external stop request
    #[serde(default)]
    pub close_position_on_stop: bool,
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_resubscribe_delay() -> u64 {
    1_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            call_timeout_ms: default_call_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            fill_resubscribe_delay_ms: default_resubscribe_delay(),
            close_position_on_stop: false,
        }
    }
}

impl EngineSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.fill_resubscribe_delay_ms)
    }

    /// Builder: set retry parameters
    pub fn with_retry_config(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Builder: set reconcile interval
    pub fn with_reconcile_interval(mut self, secs: u64) -> Self {
        self.reconcile_interval_secs = secs;
        self
    }

    /// Builder: set gateway call timeout
    pub fn with_call_timeout(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    pub fn with_resubscribe_delay(mut self, delay_ms: u64) -> Self {
        self.fill_resubscribe_delay_ms = delay_ms;
        self
    }

    /// Builder: close the position on stop
    pub fn with_close_on_stop(mut self, close: bool) -> Self {
        self.close_position_on_stop = close;
        self
    }
}
