//! Adaptive grid planning
//!
//! Converts the latest ATR and a reference price into a symmetric ladder of
//! target levels. Spacing is recomputed from the ATR on every redraw, so the
//! grid widens in volatile markets and tightens in calm ones. The ladder is
//! symmetric around the reference price at redraw time only; it is not
//! re-centered between redraws.

use crate::config::BotConfig;
use crate::helpers::round_to_tick;
use crate::types::{OrderSide, PriceLevel};

/// Plans grid levels from volatility and a reference price
#[derive(Debug, Clone, Copy)]
pub struct GridPlanner {
    grid_multiplier: f64,
    num_of_grids: u32,
    volatility_threshold: f64,
}

impl GridPlanner {
    pub fn new(grid_multiplier: f64, num_of_grids: u32, volatility_threshold: f64) -> Self {
        Self {
            grid_multiplier,
            num_of_grids,
            volatility_threshold,
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(
            config.grid_multiplier,
            config.num_of_grids,
            config.volatility_threshold,
        )
    }

    /// Grid spacing for the given ATR.
    ///
    /// An ATR at or below the volatility threshold (including zero) falls
    /// back to one tick, the smallest spacing that still produces distinct
    /// levels.
    pub fn spacing(&self, atr: f64, tick_size: f64) -> f64 {
        if atr <= self.volatility_threshold {
            return tick_size;
        }
        (atr * self.grid_multiplier).max(tick_size)
    }

    /// Produce `2 * num_of_grids` target levels around `reference_price`:
    /// `num_of_grids` buys below it and `num_of_grids` sells above it,
    /// adjacent levels one spacing apart, prices rounded to the tick size.
    ///
    /// Output order: buys nearest-first (indices `0..n`), then sells
    /// nearest-first (indices `n..2n`).
    pub fn plan(&self, reference_price: f64, atr: f64, tick_size: f64) -> Vec<PriceLevel> {
        let spacing = self.spacing(atr, tick_size);
        let n = self.num_of_grids;
        let mut levels = Vec::with_capacity(2 * n as usize);

        for i in 1..=n {
            levels.push(PriceLevel {
                index: i - 1,
                side: OrderSide::Buy,
                price: round_to_tick(reference_price - spacing * i as f64, tick_size),
            });
        }

        for i in 1..=n {
            levels.push(PriceLevel {
                index: n + i - 1,
                side: OrderSide::Sell,
                price: round_to_tick(reference_price + spacing * i as f64, tick_size),
            });
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_count_and_sides() {
        let planner = GridPlanner::new(0.5, 5, 0.0);
        let levels = planner.plan(50000.0, 100.0, 0.1);

        assert_eq!(levels.len(), 10);

        let buys: Vec<_> = levels.iter().filter(|l| l.side == OrderSide::Buy).collect();
        let sells: Vec<_> = levels.iter().filter(|l| l.side == OrderSide::Sell).collect();
        assert_eq!(buys.len(), 5);
        assert_eq!(sells.len(), 5);

        assert!(buys.iter().all(|l| l.price < 50000.0));
        assert!(sells.iter().all(|l| l.price > 50000.0));
    }

    #[test]
    fn test_adjacent_spacing_is_atr_times_multiplier() {
        let planner = GridPlanner::new(0.5, 4, 0.0);
        let levels = planner.plan(50000.0, 100.0, 0.01);
        let spacing = 100.0 * 0.5;

        let buys: Vec<_> = levels.iter().filter(|l| l.side == OrderSide::Buy).collect();
        let sells: Vec<_> = levels.iter().filter(|l| l.side == OrderSide::Sell).collect();

        for pair in buys.windows(2) {
            assert!((pair[0].price - pair[1].price - spacing).abs() < 1e-6);
        }
        for pair in sells.windows(2) {
            assert!((pair[1].price - pair[0].price - spacing).abs() < 1e-6);
        }
    }

    #[test]
    fn test_symmetric_around_reference() {
        let planner = GridPlanner::new(1.0, 3, 0.0);
        let levels = planner.plan(1000.0, 10.0, 0.01);

        for i in 0..3 {
            let buy = levels[i].price;
            let sell = levels[3 + i].price;
            assert!((1000.0 - buy - (sell - 1000.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ladder_scenario() {
        // ATR 100 at multiplier 1.0 around 50000 with two levels per side
        let planner = GridPlanner::new(1.0, 2, 0.0);
        let levels = planner.plan(50000.0, 100.0, 0.1);

        let buy_prices: Vec<f64> = levels
            .iter()
            .filter(|l| l.side == OrderSide::Buy)
            .map(|l| l.price)
            .collect();
        let sell_prices: Vec<f64> = levels
            .iter()
            .filter(|l| l.side == OrderSide::Sell)
            .map(|l| l.price)
            .collect();

        assert!((buy_prices[0] - 49900.0).abs() < 1e-6);
        assert!((buy_prices[1] - 49800.0).abs() < 1e-6);
        assert!((sell_prices[0] - 50100.0).abs() < 1e-6);
        assert!((sell_prices[1] - 50200.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_atr_falls_back_to_tick_spacing() {
        let planner = GridPlanner::new(0.5, 2, 0.0);
        assert_eq!(planner.spacing(0.0, 0.5), 0.5);

        let levels = planner.plan(100.0, 0.0, 0.5);
        assert!((levels[0].price - 99.5).abs() < 1e-9);
        assert!((levels[2].price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn test_atr_below_threshold_falls_back_to_tick_spacing() {
        let planner = GridPlanner::new(0.5, 2, 1.0);
        // ATR 0.8 is below the threshold of 1.0
        assert_eq!(planner.spacing(0.8, 0.25), 0.25);
        // ATR above the threshold uses the normal formula
        assert!((planner.spacing(10.0, 0.25) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_prices_rounded_to_tick() {
        let planner = GridPlanner::new(1.0, 1, 0.0);
        let levels = planner.plan(100.0, 0.3333, 0.01);

        for level in levels {
            let rounded = round_to_tick(level.price, 0.01);
            assert_eq!(level.price, rounded);
        }
    }

    #[test]
    fn test_unique_level_indices() {
        let planner = GridPlanner::new(0.5, 3, 0.0);
        let levels = planner.plan(500.0, 4.0, 0.01);

        let mut indices: Vec<u32> = levels.iter().map(|l| l.index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 6);
    }
}
