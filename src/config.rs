//! Settings for the `grid_engine` binary: TOML file plus `GRID__` environment overrides

use config::{Config, Environment, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{EngineSettings, GridConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Grid range, sizing and risk parameters
    pub grid: GridConfig,
    /// Engine runtime knobs (intervals, timeouts, retries)
    #[serde(default)]
    pub engine: EngineSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Paper venue the binary runs against
    #[serde(default)]
    pub paper: PaperSettings,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperSettings {
    /// Starting price; defaults to the middle of the grid range
    #[serde(default)]
    pub initial_price: Option<f64>,
    #[serde(default = "default_available_margin")]
    pub available_margin: f64,
    /// Prices replayed one per tick after start
    #[serde(default)]
    pub price_path: Vec<f64>,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            initial_price: None,
            available_margin: default_available_margin(),
            price_path: Vec::new(),
            tick_ms: default_tick_ms(),
        }
    }
}

fn default_available_margin() -> f64 {
    10_000.0
}

fn default_tick_ms() -> u64 {
    1_000
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file, e.g. GRID__GRID__LOWER_BOUND=95
            .add_source(
                Environment::with_prefix("GRID")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Parse settings from TOML text without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Paper starting price, falling back to the middle of the range
    pub fn initial_price(&self) -> f64 {
        self.paper
            .initial_price
            .unwrap_or((self.grid.lower_bound + self.grid.upper_bound) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{BoundaryAction, GridMode, SpacingMode};

    #[test]
    fn test_minimal_settings_use_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [grid]
            symbol = "SOL_USDC_PERP"
            lower_bound = 100.0
            upper_bound = 120.0
            level_count = 5
            order_quantity = 1.0
            max_position = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.grid.margin_asset, "USDC");
        assert_eq!(settings.grid.spacing_mode, SpacingMode::Arithmetic);
        assert_eq!(settings.grid.boundary_action, BoundaryAction::HaltOnly);
        assert_eq!(settings.engine, EngineSettings::default());
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.initial_price(), 110.0);
        assert!(settings.paper.price_path.is_empty());
        assert!(settings.grid.validate().is_ok());
    }

    #[test]
    fn test_full_settings() {
        let settings = Settings::from_toml_str(
            r#"
            [grid]
            symbol = "ETH_USDC_PERP"
            lower_bound = 2000.0
            upper_bound = 4000.0
            level_count = 21
            spacing_mode = "geometric"
            grid_mode = "long_only"
            order_quantity = 0.1
            max_position = 1.0
            leverage = 3
            boundary_tolerance = 0.02
            boundary_action = "auto_adjust"
            stop_loss = -250.0

            [engine]
            reconcile_interval_secs = 5
            close_position_on_stop = true

            [log]
            level = "debug"

            [paper]
            initial_price = 2950.0
            available_margin = 5000.0
            price_path = [2940.0, 2900.0, 3100.0]
            tick_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.grid.grid_mode, GridMode::LongOnly);
        assert_eq!(settings.grid.spacing_mode, SpacingMode::Geometric);
        assert_eq!(settings.grid.boundary_action, BoundaryAction::AutoAdjust);
        assert_eq!(settings.grid.stop_loss, Some(-250.0));
        assert_eq!(settings.engine.reconcile_interval_secs, 5);
        assert_eq!(settings.engine.call_timeout_ms, 5_000);
        assert!(settings.engine.close_position_on_stop);
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.initial_price(), 2950.0);
        assert_eq!(settings.paper.price_path, vec![2940.0, 2900.0, 3100.0]);
        assert_eq!(settings.paper.tick_ms, 250);
    }

    #[test]
    fn test_missing_grid_section_fails() {
        assert!(Settings::from_toml_str("[log]\nlevel = \"warn\"\n").is_err());
    }
}
