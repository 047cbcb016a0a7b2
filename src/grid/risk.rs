//! Margin, position-limit and PnL exit checks

use log::{info, warn};

use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::types::{HaltReason, PositionState};

/// Extra margin demanded on top of the raw requirement, absorbs slippage and fees
pub const MARGIN_BUFFER: f64 = 1.1;

/// Fraction of max_position at which the position counts as near its limit
const DEFAULT_WARNING_RATIO: f64 = 0.9;

/// Position exposure relative to max_position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionRisk {
    Safe,
    NearLimit,
    AtLimit,
}

/// Stateless go/no-go checks over price, margin and position
#[derive(Debug, Clone, Copy)]
pub struct RiskGuard {
    margin_buffer: f64,
    warning_ratio: f64,
}

impl Default for RiskGuard {
    fn default() -> Self {
        Self {
            margin_buffer: MARGIN_BUFFER,
            warning_ratio: DEFAULT_WARNING_RATIO,
        }
    }
}

impl RiskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Margin needed to carry max_position at `current_price`
    ///
    /// Formula: max_position * current_price / leverage * 1.1
    pub fn required_margin(&self, current_price: f64, config: &GridConfig) -> f64 {
        config.max_position * current_price / config.leverage.max(1) as f64 * self.margin_buffer
    }

    /// Fail with `InsufficientFunds` when the account cannot margin the grid
    pub fn check_margin(
        &self,
        current_price: f64,
        available_margin: f64,
        config: &GridConfig,
    ) -> GridResult<()> {
        let required = self.required_margin(current_price, config);

        if available_margin < required {
            warn!(
                "Margin check failed for {}: available={:.4}, required={:.4}",
                config.symbol, available_margin, required
            );
            return Err(GridError::InsufficientFunds {
                available: available_margin,
                required,
            });
        }

        info!(
            "Margin check passed for {}: available={:.4}, required={:.4}",
            config.symbol, available_margin, required
        );
        Ok(())
    }

    /// Stop-loss / take-profit evaluation on the freshly pulled position
    pub fn evaluate_exit(
        &self,
        position: &PositionState,
        current_price: f64,
        config: &GridConfig,
    ) -> Option<HaltReason> {
        if position.is_flat() {
            return None;
        }

        let unrealized_pnl = position.unrealized_pnl(current_price);

        if let Some(stop_loss) = config.stop_loss {
            if unrealized_pnl <= stop_loss {
                return Some(HaltReason::StopLoss { unrealized_pnl });
            }
        }

        if let Some(take_profit) = config.take_profit {
            if unrealized_pnl >= take_profit {
                return Some(HaltReason::TakeProfit { unrealized_pnl });
            }
        }

        None
    }

    /// Classify the position against max_position
    pub fn position_risk(&self, position: &PositionState, config: &GridConfig) -> PositionRisk {
        let exposure = position.size.abs();

        if exposure >= config.max_position {
            PositionRisk::AtLimit
        } else if exposure >= config.max_position * self.warning_ratio {
            PositionRisk::NearLimit
        } else {
            PositionRisk::Safe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perp_config() -> GridConfig {
        GridConfig::new("SOL_USDC_PERP", 250.0, 350.0, 11, 0.2, 2.0).with_leverage(5)
    }

    #[test]
    fn test_required_margin() {
        // 2 * 300 / 5 * 1.1 = 132
        let guard = RiskGuard::new();
        let required = guard.required_margin(300.0, &perp_config());
        assert!((required - 132.0).abs() < 1e-9);
    }

    #[test]
    fn test_margin_sufficient() {
        let guard = RiskGuard::new();
        assert!(guard.check_margin(300.0, 500.0, &perp_config()).is_ok());
        // Exactly at the requirement is enough
        let required = guard.required_margin(300.0, &perp_config());
        assert!(guard.check_margin(300.0, required, &perp_config()).is_ok());
    }

    #[test]
    fn test_margin_insufficient() {
        let guard = RiskGuard::new();
        match guard.check_margin(300.0, 100.0, &perp_config()) {
            Err(GridError::InsufficientFunds {
                available,
                required,
            }) => {
                assert_eq!(available, 100.0);
                assert!((required - 132.0).abs() < 1e-9);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_loss_trigger() {
        let guard = RiskGuard::new();
        let config = perp_config().with_stop_loss(-50.0);

        // 5 long from 100, price 88 => -60
        let position = PositionState::new(5.0, 100.0);
        assert!(matches!(
            guard.evaluate_exit(&position, 88.0, &config),
            Some(HaltReason::StopLoss { .. })
        ));
        assert_eq!(guard.evaluate_exit(&position, 95.0, &config), None);
    }

    #[test]
    fn test_take_profit_trigger() {
        let guard = RiskGuard::new();
        let config = perp_config().with_take_profit(100.0);

        // 5 long from 100, price 124 => +120
        let position = PositionState::new(5.0, 100.0);
        assert!(matches!(
            guard.evaluate_exit(&position, 124.0, &config),
            Some(HaltReason::TakeProfit { .. })
        ));

        // Flat position never triggers
        assert_eq!(
            guard.evaluate_exit(&PositionState::default(), 124.0, &config),
            None
        );
    }

    #[test]
    fn test_position_limits() {
        let guard = RiskGuard::new();
        let config = perp_config();

        assert_eq!(
            guard.position_risk(&PositionState::new(0.5, 300.0), &config),
            PositionRisk::Safe
        );
        assert_eq!(
            guard.position_risk(&PositionState::new(-1.9, 300.0), &config),
            PositionRisk::NearLimit
        );
        assert_eq!(
            guard.position_risk(&PositionState::new(2.0, 300.0), &config),
            PositionRisk::AtLimit
        );
    }
}
