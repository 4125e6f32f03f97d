//! Core data types for the grid engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }
}

/// Lifecycle status of an order
///
/// Transitions: `Pending -> Open -> {Filled | Cancelled | Rejected}`.
/// Terminal statuses are never re-entered; the oid is retired once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order sent, waiting for exchange confirmation
    Pending,
    /// Order resting on the book
    Open,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by the exchange
    Rejected,
}

impl OrderStatus {
    /// Check if the order is still working on the exchange
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }

    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// A tracked exchange order
#[derive(Debug, Clone)]
pub struct Order {
    /// Exchange-assigned order id
    pub oid: u64,
    /// Client-assigned id passed at submission
    pub client_id: Uuid,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub status: OrderStatus,
    /// Grid level this order belongs to
    pub level_index: u32,
}

/// A target price level produced by the planner
///
/// Ephemeral: regenerated whenever the grid is redrawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    /// Level index, 1-based distance from the reference price
    pub index: u32,
    pub side: OrderSide,
    pub price: f64,
}

/// Direction of the open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Current open position for one symbol
///
/// Mutated only by the order manager when fills are observed; other
/// components read cloned snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub side: PositionSide,
    /// Absolute position size in base asset
    pub size: f64,
    /// Average entry price; None while flat
    pub entry_price: Option<f64>,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size <= 0.0
    }

    /// Side of an order that would close this position
    pub fn closing_side(&self) -> Option<OrderSide> {
        match self.side {
            PositionSide::Long => Some(OrderSide::Sell),
            PositionSide::Short => Some(OrderSide::Buy),
            PositionSide::Flat => None,
        }
    }

    /// Apply a fill and return the realized PnL it produced.
    ///
    /// Adding to the position computes a size-weighted entry price; reducing
    /// realizes PnL against the current entry; filling through zero flips
    /// the position with the remainder at the fill price.
    pub fn apply_fill(&mut self, side: OrderSide, qty: f64, price: f64) -> f64 {
        if qty <= 0.0 {
            return 0.0;
        }

        let fill_dir = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        if self.is_flat() {
            self.side = fill_dir;
            self.size = qty;
            self.entry_price = Some(price);
            return 0.0;
        }

        let entry = self.entry_price.unwrap_or(price);

        if self.side == fill_dir {
            // Adding: weighted average entry
            let new_size = self.size + qty;
            self.entry_price = Some((entry * self.size + price * qty) / new_size);
            self.size = new_size;
            return 0.0;
        }

        // Reducing (or flipping)
        let closed = self.size.min(qty);
        let direction = if self.side == PositionSide::Long { 1.0 } else { -1.0 };
        let realized = (price - entry) * closed * direction;

        let remainder = qty - closed;
        self.size -= closed;

        if self.size <= f64::EPSILON {
            if remainder > f64::EPSILON {
                self.side = fill_dir;
                self.size = remainder;
                self.entry_price = Some(price);
            } else {
                *self = Position::flat();
            }
        }

        realized
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}
