//! Boundary breach detection and auto-adjust recentering

use log::info;
use serde::{Deserialize, Serialize};

use super::config::{GridConfig, SpacingMode};
use super::types::HaltReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachDirection {
    Above,
    Below,
}

/// Price left the range by more than the configured tolerance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub direction: BreachDirection,
    pub price: f64,
    /// The tolerance-adjusted bound that was crossed
    pub limit: f64,
}

impl Breach {
    pub fn halt_reason(&self) -> HaltReason {
        HaltReason::BoundaryBreach {
            price: self.price,
            limit: self.limit,
        }
    }
}

/// Stateless boundary checks
pub struct BoundaryMonitor;

impl BoundaryMonitor {
    /// Breach when price > upper*(1+tol) or price < lower*(1-tol); the limits
    /// themselves are inside the range
    pub fn evaluate(current_price: f64, config: &GridConfig) -> Option<Breach> {
        let tol = config.boundary_tolerance;
        let upper_limit = config.upper_bound * (1.0 + tol);
        let lower_limit = config.lower_bound * (1.0 - tol);

        if current_price > upper_limit {
            Some(Breach {
                direction: BreachDirection::Above,
                price: current_price,
                limit: upper_limit,
            })
        } else if current_price < lower_limit {
            Some(Breach {
                direction: BreachDirection::Below,
                price: current_price,
                limit: lower_limit,
            })
        } else {
            None
        }
    }

    /// Same-width range centered on `current_price`
    ///
    /// Arithmetic grids keep the absolute width. Geometric grids keep the
    /// upper/lower ratio, and so does an arithmetic grid whose shifted lower
    /// bound would not be positive.
    pub fn recenter(config: &GridConfig, current_price: f64) -> GridConfig {
        let half_width = config.width() / 2.0;
        let arithmetic_lower = current_price - half_width;

        let (lower, upper) = match config.spacing_mode {
            SpacingMode::Arithmetic if arithmetic_lower > 0.0 => {
                (arithmetic_lower, current_price + half_width)
            }
            _ => {
                let half_ratio = (config.upper_bound / config.lower_bound).sqrt();
                (current_price / half_ratio, current_price * half_ratio)
            }
        };

        info!(
            "Recentered {} on {}: [{}, {}] -> [{}, {}]",
            config.symbol, current_price, config.lower_bound, config.upper_bound, lower, upper
        );
        config.with_bounds(Some(lower), Some(upper))
    }
}
