//! Live market data
//!
//! [`MarketDataFeed`] consumes the two independent event streams from the
//! exchange collaborator (order-book depth, trade ticks) and folds them into
//! a single [`MarketSnapshot`], published over a `watch` channel: consumers
//! always see the latest snapshot, never a queue of stale ones. A stream
//! that closes is resubscribed, not treated as fatal.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::watch;

use crate::errors::Result;
use crate::exchange::Exchange;

/// Order-book depth update: (price, quantity) per side
#[derive(Debug, Clone, Default)]
pub struct DepthEvent {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// A single trade tick
#[derive(Debug, Clone, Copy)]
pub struct TradeEvent {
    pub price: f64,
    pub qty: f64,
}

/// Latest view of the market for one symbol
///
/// Replaced wholesale on each depth update; individual fields are
/// last-write-wins across the two streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub mark_price: f64,
    /// Order-book imbalance in [-1, 1]
    pub imbalance: f64,
}

/// Normalized bid/ask volume imbalance.
///
/// Defined as 0 when both volumes are zero.
pub fn order_book_imbalance(bid_volume: f64, ask_volume: f64) -> f64 {
    let total = bid_volume + ask_volume;
    if total <= 0.0 {
        return 0.0;
    }
    (bid_volume - ask_volume) / total
}

/// Fold a depth update into the snapshot. An empty side leaves the
/// previous values for that side in place.
fn apply_depth(snap: &mut MarketSnapshot, event: &DepthEvent) {
    if !event.bids.is_empty() {
        snap.best_bid = event
            .bids
            .iter()
            .map(|&(price, _)| price)
            .fold(f64::MIN, f64::max);
        snap.bid_volume = event.bids.iter().map(|&(_, qty)| qty).sum();
    }

    if !event.asks.is_empty() {
        snap.best_ask = event
            .asks
            .iter()
            .map(|&(price, _)| price)
            .fold(f64::MAX, f64::min);
        snap.ask_volume = event.asks.iter().map(|&(_, qty)| qty).sum();
    }

    snap.imbalance = order_book_imbalance(snap.bid_volume, snap.ask_volume);
}

fn apply_trade(snap: &mut MarketSnapshot, event: &TradeEvent) {
    snap.mark_price = event.price;
}

/// Read side of the snapshot channel
#[derive(Clone)]
pub struct SnapshotHandle {
    rx: watch::Receiver<MarketSnapshot>,
}

impl SnapshotHandle {
    /// The latest published snapshot
    pub fn latest(&self) -> MarketSnapshot {
        *self.rx.borrow()
    }
}

/// Delay before resubscribing after a stream closes
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Consumes depth and trade streams for one symbol
pub struct MarketDataFeed {
    symbol: String,
    tx: watch::Sender<MarketSnapshot>,
}

impl MarketDataFeed {
    pub fn new(symbol: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(MarketSnapshot::default());
        Self {
            symbol: symbol.into(),
            tx,
        }
    }

    /// Subscribe a reader to the snapshot channel
    pub fn handle(&self) -> SnapshotHandle {
        SnapshotHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Run the consumption loop until shutdown is signalled.
    ///
    /// Events from each stream are applied in arrival order; every applied
    /// event publishes a fresh snapshot. A closed stream triggers
    /// resubscription after a short delay.
    pub async fn run<E: Exchange>(
        &self,
        exchange: Arc<E>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut current = *self.tx.borrow();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut depth_rx = exchange.subscribe_depth(&self.symbol).await?;
            let mut trade_rx = exchange.subscribe_trades(&self.symbol).await?;
            debug!("{}: market data streams subscribed", self.symbol);

            loop {
                tokio::select! {
                    depth = depth_rx.recv() => match depth {
                        Some(event) => {
                            apply_depth(&mut current, &event);
                            let _ = self.tx.send(current);
                        }
                        None => {
                            warn!("{}: depth stream closed, resubscribing", self.symbol);
                            break;
                        }
                    },
                    trade = trade_rx.recv() => match trade {
                        Some(event) => {
                            apply_trade(&mut current, &event);
                            let _ = self.tx.send(current);
                        }
                        None => {
                            warn!("{}: trade stream closed, resubscribing", self.symbol);
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }

            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }
}
