//! Position risk monitoring
//!
//! [`RiskMonitor`] recomputes the PnL picture on every tick and enforces
//! the three exit rules. Evaluation order is take-profit, then stop-loss,
//! then trailing stop; the first satisfied condition wins for that tick.
//! Closing orders go through the same submission path as grid orders.

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::config::BotConfig;
use crate::errors::Result;
use crate::exchange::Exchange;
use crate::orders::OrderLifecycleManager;
use crate::types::{Position, PositionSide};

/// PnL state computed on a monitoring tick
///
/// Recomputed from Position + mark price each tick; display-only, never
/// persisted.
#[derive(Debug, Clone, Copy)]
pub struct PnLRecord {
    pub unrealized: f64,
    /// Unrealized PnL as a percentage of position notional at entry
    pub pnl_percent: f64,
    pub realized: f64,
    pub timestamp: DateTime<Utc>,
}

impl PnLRecord {
    /// Compute the record for a position against the current mark price
    pub fn compute(position: &Position, mark_price: f64, realized: f64) -> Self {
        let (unrealized, pnl_percent) = match (position.entry_price, position.side) {
            (Some(entry), side) if !position.is_flat() && entry > 0.0 => {
                let direction = match side {
                    PositionSide::Long => 1.0,
                    PositionSide::Short => -1.0,
                    PositionSide::Flat => 0.0,
                };
                let unrealized = (mark_price - entry) * position.size * direction;
                let pnl_percent = unrealized / (entry * position.size) * 100.0;
                (unrealized, pnl_percent)
            }
            _ => (0.0, 0.0),
        };

        Self {
            unrealized,
            pnl_percent,
            realized,
            timestamp: Utc::now(),
        }
    }
}

/// Which exit rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
}

/// Evaluates exit rules against the live PnL
pub struct RiskMonitor {
    take_profit_percent: f64,
    stop_loss_percent: f64,
    trailing_stop_callback: f64,
    /// Highest favorable PnL percent seen since the position opened
    peak_pnl_percent: Option<f64>,
}

impl RiskMonitor {
    pub fn new(take_profit_percent: f64, stop_loss_percent: f64, trailing_stop_callback: f64) -> Self {
        Self {
            take_profit_percent,
            stop_loss_percent,
            trailing_stop_callback,
            peak_pnl_percent: None,
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(
            config.take_profit_percent,
            config.stop_loss_percent,
            config.trailing_stop_callback,
        )
    }

    /// Forget the trailing peak (position went flat)
    pub fn reset(&mut self) {
        self.peak_pnl_percent = None;
    }

    /// Evaluate the exit rules for this tick.
    ///
    /// Take-profit, stop-loss, and trailing stop are mutually exclusive;
    /// the first satisfied rule wins.
    pub fn evaluate(&mut self, record: &PnLRecord, position: &Position) -> Option<ExitReason> {
        if position.is_flat() {
            self.reset();
            return None;
        }

        if record.pnl_percent >= self.take_profit_percent {
            return Some(ExitReason::TakeProfit);
        }

        if record.pnl_percent <= -self.stop_loss_percent {
            return Some(ExitReason::StopLoss);
        }

        if record.pnl_percent > 0.0 {
            let peak = self
                .peak_pnl_percent
                .map(|p| p.max(record.pnl_percent))
                .unwrap_or(record.pnl_percent);
            self.peak_pnl_percent = Some(peak);
        }

        if let Some(peak) = self.peak_pnl_percent {
            if peak - record.pnl_percent > self.trailing_stop_callback {
                return Some(ExitReason::TrailingStop);
            }
        }

        None
    }

    /// One monitoring tick: recompute PnL, evaluate the exit rules, and
    /// flatten the position when a rule fires.
    ///
    /// Returns the exit reason when an exit was issued this tick.
    pub async fn check_and_enforce<E: Exchange>(
        &mut self,
        manager: &OrderLifecycleManager<E>,
        mark_price: f64,
    ) -> Result<Option<ExitReason>> {
        let position = manager.position().await;
        let realized = manager.realized_pnl().await;
        let record = PnLRecord::compute(&position, mark_price, realized);

        let Some(reason) = self.evaluate(&record, &position) else {
            return Ok(None);
        };

        warn!(
            "{:?} triggered: pnl {:.4} ({:.2}%), closing position {:?} {}",
            reason, record.unrealized, record.pnl_percent, position.side, position.size
        );

        // The close must not be dropped silently; a failure here is an error
        // for the caller to surface
        manager.flatten(mark_price).await?;
        self.reset();

        info!("Exit order submitted ({:?})", reason);
        Ok(Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, PositionSide};

    fn long(size: f64, entry: f64) -> Position {
        Position {
            side: PositionSide::Long,
            size,
            entry_price: Some(entry),
        }
    }

    fn short(size: f64, entry: f64) -> Position {
        Position {
            side: PositionSide::Short,
            size,
            entry_price: Some(entry),
        }
    }

    #[test]
    fn test_pnl_record_long() {
        let record = PnLRecord::compute(&long(2.0, 100.0), 110.0, 5.0);

        assert!((record.unrealized - 20.0).abs() < 1e-9);
        assert!((record.pnl_percent - 10.0).abs() < 1e-9);
        assert_eq!(record.realized, 5.0);
    }

    #[test]
    fn test_pnl_record_short() {
        let record = PnLRecord::compute(&short(1.0, 100.0), 90.0, 0.0);

        assert!((record.unrealized - 10.0).abs() < 1e-9);
        assert!((record.pnl_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pnl_record_flat() {
        let record = PnLRecord::compute(&Position::flat(), 50000.0, 1.5);
        assert_eq!(record.unrealized, 0.0);
        assert_eq!(record.pnl_percent, 0.0);
        assert_eq!(record.realized, 1.5);
    }

    #[test]
    fn test_take_profit_trigger() {
        let mut monitor = RiskMonitor::new(5.0, 2.0, 0.5);
        let position = long(1.0, 100.0);

        // 4.9% is under the threshold
        let record = PnLRecord::compute(&position, 104.9, 0.0);
        assert_eq!(monitor.evaluate(&record, &position), None);

        // 5% hits it
        let record = PnLRecord::compute(&position, 105.0, 0.0);
        assert_eq!(
            monitor.evaluate(&record, &position),
            Some(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_stop_loss_trigger() {
        let mut monitor = RiskMonitor::new(5.0, 2.0, 0.5);
        let position = long(1.0, 100.0);

        let record = PnLRecord::compute(&position, 98.0, 0.0);
        assert_eq!(
            monitor.evaluate(&record, &position),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_stop_loss_wins_over_trailing() {
        let mut monitor = RiskMonitor::new(50.0, 2.0, 0.4);
        let position = long(1.0, 100.0);

        // Build a 3% peak, then drop into loss: both the stop-loss and the
        // trailing retrace are satisfied, stop-loss is evaluated first
        let record = PnLRecord::compute(&position, 103.0, 0.0);
        assert_eq!(monitor.evaluate(&record, &position), None);

        let record = PnLRecord::compute(&position, 97.5, 0.0);
        assert_eq!(
            monitor.evaluate(&record, &position),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_trailing_stop_trigger() {
        let mut monitor = RiskMonitor::new(50.0, 50.0, 0.4);
        let position = long(1.0, 100.0);

        // Climb to a 3% peak
        for mark in [101.0, 103.0] {
            let record = PnLRecord::compute(&position, mark, 0.0);
            assert_eq!(monitor.evaluate(&record, &position), None);
        }

        // Retrace to 2.5%: 0.5 > 0.4 callback
        let record = PnLRecord::compute(&position, 102.5, 0.0);
        assert_eq!(
            monitor.evaluate(&record, &position),
            Some(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn test_trailing_needs_profit_first() {
        let mut monitor = RiskMonitor::new(50.0, 50.0, 0.4);
        let position = long(1.0, 100.0);

        // Straight into a mild loss: stop-loss territory is far away and no
        // peak was ever set, so nothing fires
        let record = PnLRecord::compute(&position, 99.0, 0.0);
        assert_eq!(monitor.evaluate(&record, &position), None);
    }

    #[test]
    fn test_flat_position_resets_peak() {
        let mut monitor = RiskMonitor::new(50.0, 50.0, 0.4);
        let position = long(1.0, 100.0);

        let record = PnLRecord::compute(&position, 103.0, 0.0);
        monitor.evaluate(&record, &position);
        assert!(monitor.peak_pnl_percent.is_some());

        let flat = Position::flat();
        let record = PnLRecord::compute(&flat, 103.0, 0.0);
        monitor.evaluate(&record, &flat);
        assert!(monitor.peak_pnl_percent.is_none());
    }

    #[test]
    fn test_closing_side_matches_direction() {
        assert_eq!(long(1.0, 100.0).closing_side(), Some(OrderSide::Sell));
        assert_eq!(short(1.0, 100.0).closing_side(), Some(OrderSide::Buy));
    }
}
