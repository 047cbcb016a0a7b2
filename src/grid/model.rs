//! Price ladder calculation (arithmetic or geometric spacing)

use serde::{Deserialize, Serialize};

use super::config::{GridConfig, SpacingMode};
use super::errors::{GridError, GridResult};
use super::types::GridLevel;

/// Ordered price levels of one grid epoch
///
/// Pure and deterministic: the same config always yields the same ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLadder {
    levels: Vec<GridLevel>,
}

impl GridLadder {
    /// Calculate all grid price levels for the config's spacing mode
    pub fn build(config: &GridConfig) -> GridResult<Self> {
        config.validate_range()?;

        let n = config.level_count;
        let last = (n - 1) as f64;
        let lower = config.lower_bound;
        let upper = config.upper_bound;

        let levels: Vec<GridLevel> = (0..n)
            .map(|i| {
                let price = if i == n - 1 {
                    // Pin the top level so rounding never overshoots the bound
                    upper
                } else {
                    match config.spacing_mode {
                        SpacingMode::Arithmetic => lower + i as f64 * (upper - lower) / last,
                        SpacingMode::Geometric => lower * (upper / lower).powf(i as f64 / last),
                    }
                };
                GridLevel { index: i, price }
            })
            .collect();

        if levels.windows(2).any(|w| w[1].price <= w[0].price) {
            return Err(GridError::InvalidRange(format!(
                "range [{}, {}] too narrow for {} levels",
                lower, upper, n
            )));
        }

        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&GridLevel> {
        self.levels.get(index as usize)
    }

    pub fn prices(&self) -> Vec<f64> {
        self.levels.iter().map(|l| l.price).collect()
    }

    /// Index of the level closest to `price`; the grid leaves it uncovered
    pub fn reference_index(&self, price: f64) -> u32 {
        self.levels
            .iter()
            .min_by(|a, b| {
                let diff_a = (a.price - price).abs();
                let diff_b = (b.price - price).abs();
                diff_a.total_cmp(&diff_b)
            })
            .map(|l| l.index)
            .unwrap_or(0)
    }

    /// Smallest gap between adjacent levels
    pub fn min_spacing(&self) -> f64 {
        self.levels
            .windows(2)
            .map(|w| w[1].price - w[0].price)
            .fold(f64::INFINITY, f64::min)
    }

    /// Level whose price matches `price` to within a quarter of the tightest gap
    pub fn match_price(&self, price: f64) -> Option<u32> {
        let tolerance = self.min_spacing() / 4.0;
        let index = self.reference_index(price);
        self.get(index)
            .filter(|level| (level.price - price).abs() <= tolerance)
            .map(|level| level.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lower: f64, upper: f64, n: u32, spacing: SpacingMode) -> GridConfig {
        GridConfig::new("SOL_USDC_PERP", lower, upper, n, 1.0, 10.0).with_spacing(spacing)
    }

    #[test]
    fn test_arithmetic_levels() {
        let ladder = GridLadder::build(&config(100.0, 120.0, 5, SpacingMode::Arithmetic)).unwrap();
        assert_eq!(ladder.prices(), vec![100.0, 105.0, 110.0, 115.0, 120.0]);
    }

    #[test]
    fn test_geometric_levels_constant_ratio() {
        let ladder = GridLadder::build(&config(100.0, 200.0, 11, SpacingMode::Geometric)).unwrap();

        assert_eq!(ladder.len(), 11);
        assert!((ladder.levels()[0].price - 100.0).abs() < 1e-9);
        assert!((ladder.levels()[10].price - 200.0).abs() < 1e-9);

        let ratio = ladder.levels()[1].price / ladder.levels()[0].price;
        for w in ladder.levels().windows(2) {
            assert!((w[1].price / w[0].price - ratio).abs() < 1e-9);
        }
    }

    #[test]
    fn test_level_count_and_monotonic() {
        for spacing in [SpacingMode::Arithmetic, SpacingMode::Geometric] {
            for n in [2, 5, 10, 21, 51, 201] {
                let ladder = GridLadder::build(&config(90.0, 110.0, n, spacing)).unwrap();
                assert_eq!(ladder.len(), n as usize);
                for (i, w) in ladder.levels().windows(2).enumerate() {
                    assert!(w[1].price > w[0].price);
                    assert_eq!(w[0].index, i as u32);
                }
            }
        }
    }

    #[test]
    fn test_small_and_large_ranges() {
        let ladder = GridLadder::build(&config(99.99, 100.01, 6, SpacingMode::Arithmetic)).unwrap();
        assert_eq!(ladder.len(), 6);
        assert!(ladder.levels()[0].price < ladder.levels()[5].price);

        let ladder = GridLadder::build(&config(1.0, 1000.0, 11, SpacingMode::Arithmetic)).unwrap();
        assert_eq!(ladder.levels()[0].price, 1.0);
        assert_eq!(ladder.levels()[10].price, 1000.0);
    }

    #[test]
    fn test_invalid_ranges() {
        let cases = [
            config(120.0, 100.0, 5, SpacingMode::Arithmetic),
            config(100.0, 100.0, 5, SpacingMode::Arithmetic),
            config(100.0, 120.0, 1, SpacingMode::Arithmetic),
            config(-5.0, 120.0, 5, SpacingMode::Geometric),
            config(0.0, 120.0, 5, SpacingMode::Geometric),
        ];
        for cfg in cases {
            assert!(matches!(
                GridLadder::build(&cfg),
                Err(GridError::InvalidRange(_))
            ));
        }
    }

    #[test]
    fn test_reference_and_price_matching() {
        let ladder = GridLadder::build(&config(100.0, 120.0, 5, SpacingMode::Arithmetic)).unwrap();

        assert_eq!(ladder.reference_index(111.0), 2);
        assert_eq!(ladder.reference_index(50.0), 0);
        assert_eq!(ladder.reference_index(500.0), 4);

        assert_eq!(ladder.match_price(105.0), Some(1));
        assert_eq!(ladder.match_price(105.5), Some(1));
        // Halfway between two levels belongs to neither
        assert_eq!(ladder.match_price(107.5), None);
        assert_eq!(ladder.match_price(90.0), None);
    }
}
