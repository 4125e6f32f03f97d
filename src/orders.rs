//! Order lifecycle management
//!
//! [`OrderLifecycleManager`] owns the authoritative map of live orders and
//! the open position for one symbol, and reconciles desired state (planner
//! levels) against observed state (the exchange's open-order list). All
//! mutating operations take the single state lock for their full duration,
//! so a grid draw, a reconcile pass, and a flatten never interleave
//! partially; readers get cloned snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::BotConfig;
use crate::errors::{Error, Result};
use crate::exchange::{
    with_retry, Exchange, ExchangeOrderStatus, InstrumentRules, OrderRequest,
};
use crate::helpers::{round_to_step, round_to_tick};
use crate::types::{Order, OrderSide, OrderStatus, Position, PriceLevel};

/// Mutable ladder state guarded by the manager's lock
struct LadderState {
    /// Active orders keyed by exchange order id
    orders: HashMap<u64, Order>,
    position: Position,
    realized_pnl: f64,
    /// Grid spacing in effect since the last draw
    spacing: f64,
    /// Levels that already consumed their one re-submission
    resubmitted_levels: HashSet<u32>,
    /// Levels disabled until the next full redraw
    inactive_levels: HashSet<u32>,
    /// While true (risk exit in flight) no grid or replacement orders are
    /// placed
    suspended: bool,
}

impl LadderState {
    fn new() -> Self {
        Self {
            orders: HashMap::new(),
            position: Position::flat(),
            realized_pnl: 0.0,
            spacing: 0.0,
            resubmitted_levels: HashSet::new(),
            inactive_levels: HashSet::new(),
            suspended: false,
        }
    }

    fn level_occupied(&self, level_index: u32) -> bool {
        self.orders
            .values()
            .any(|o| o.level_index == level_index && o.status.is_active())
    }
}

/// Read-only summary of the ladder for logging and monitoring
#[derive(Debug, Clone)]
pub struct LadderSummary {
    pub active_buys: usize,
    pub active_sells: usize,
    pub position: Position,
    pub realized_pnl: f64,
    pub suspended: bool,
}

/// Owns orders and position for one symbol
pub struct OrderLifecycleManager<E: Exchange> {
    symbol: String,
    config: BotConfig,
    rules: InstrumentRules,
    exchange: Arc<E>,
    state: Mutex<LadderState>,
}

impl<E: Exchange> OrderLifecycleManager<E> {
    pub fn new(config: BotConfig, rules: InstrumentRules, exchange: Arc<E>) -> Self {
        Self {
            symbol: config.symbol.clone(),
            config,
            rules,
            exchange,
            state: Mutex::new(LadderState::new()),
        }
    }

    /// Adopt a position already open on the exchange (startup recovery)
    pub async fn adopt_position(&self, position: Position) {
        let mut state = self.state.lock().await;
        state.position = position;
    }

    /// Place grid orders for every target level that has no open order.
    ///
    /// Returns the number of orders placed. Levels whose rounded quantity
    /// falls below the instrument minimum are skipped and logged, not
    /// retried. Clears per-level re-submission bookkeeping from the
    /// previous grid.
    pub async fn draw_grid(&self, levels: &[PriceLevel], spacing: f64) -> Result<usize> {
        let mut state = self.state.lock().await;

        if state.suspended {
            debug!("{}: draw skipped, risk exit in flight", self.symbol);
            return Ok(0);
        }

        state.spacing = spacing;
        state.resubmitted_levels.clear();
        state.inactive_levels.clear();

        let mut placed = 0;
        for level in levels {
            if state.level_occupied(level.index) {
                continue;
            }

            match self
                .submit_locked(&mut state, level.side, level.price, self.config.volume, level.index, false)
                .await
            {
                Ok(_) => placed += 1,
                Err(Error::InvalidOrderParams(reason)) => {
                    warn!(
                        "{}: skipping level {} at {}: {}",
                        self.symbol, level.index, level.price, reason
                    );
                }
                Err(e) => {
                    error!(
                        "{}: failed to place level {} at {}: {}",
                        self.symbol, level.index, level.price, e
                    );
                }
            }
        }

        info!(
            "{}: grid drawn, {placed}/{} orders placed, spacing {:.prec$}",
            self.symbol,
            levels.len(),
            spacing,
            prec = self.config.price_decimals as usize
        );
        Ok(placed)
    }

    /// Reconcile tracked orders against the exchange.
    ///
    /// Tracked orders missing from the open set are resolved by a status
    /// query: fills update the position and spawn a replacement on the
    /// opposite side one spacing away; unexpected cancels and rejects get
    /// one re-submission before the level goes inactive. Returns the number
    /// of fills processed.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut state = self.state.lock().await;

        let open = self.exchange.open_orders(&self.symbol).await?;
        let open_oids: HashSet<u64> = open.iter().map(|o| o.oid).collect();

        for info in &open {
            if !state.orders.contains_key(&info.oid) {
                warn!(
                    "{}: {}",
                    self.symbol,
                    Error::ReconciliationConflict(info.oid)
                );
            }
        }

        // Process departures in oid order: exchanges assign oids
        // monotonically, so this follows the order the exchange saw them
        let mut gone: Vec<u64> = state
            .orders
            .keys()
            .filter(|oid| !open_oids.contains(oid))
            .copied()
            .collect();
        gone.sort_unstable();

        let mut fills = 0;
        for oid in gone {
            let status = self.exchange.query_order(&self.symbol, oid).await?;
            let order = match state.orders.remove(&oid) {
                Some(order) => order,
                None => continue,
            };

            match status {
                ExchangeOrderStatus::Open => {
                    // Raced with the open-order poll; keep tracking it
                    state.orders.insert(oid, order);
                }
                ExchangeOrderStatus::Filled { avg_price } => {
                    fills += 1;
                    self.apply_fill_locked(&mut state, &order, avg_price).await;
                }
                ExchangeOrderStatus::Cancelled | ExchangeOrderStatus::Rejected => {
                    self.handle_unexpected_terminal_locked(&mut state, &order, &status)
                        .await;
                }
                ExchangeOrderStatus::Unknown => {
                    warn!("{}: {}", self.symbol, Error::ReconciliationConflict(oid));
                }
            }
        }

        Ok(fills)
    }

    /// Cancel all tracked orders, optionally filtered by side.
    ///
    /// Idempotent: orders already terminal (or a second call finding
    /// nothing active) are a no-op, not an error. Returns the number of
    /// cancels issued.
    pub async fn cancel_all(&self, side_filter: Option<OrderSide>) -> Result<u32> {
        let mut state = self.state.lock().await;
        let cancelled = self.cancel_all_locked(&mut state, side_filter).await;
        info!(
            "{}: cancelled {} {} orders",
            self.symbol,
            cancelled,
            side_filter.map(|s| s.as_str()).unwrap_or("")
        );
        Ok(cancelled)
    }

    /// Cancel the resting ladder and submit one closing order for the full
    /// position at the given price. No further grid orders are placed until
    /// [`resume`](Self::resume) is called after the position is observed
    /// flat. Returns the closing order id, or None if already flat.
    pub async fn flatten(&self, mark_price: f64) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;

        let side = match state.position.closing_side() {
            Some(side) => side,
            None => return Ok(None),
        };
        let qty = state.position.size;

        self.cancel_all_locked(&mut state, None).await;
        state.suspended = true;

        let price = round_to_tick(mark_price, self.rules.tick_size);
        let oid = self
            .submit_locked(&mut state, side, price, qty, u32::MAX, true)
            .await?;

        info!(
            "{}: position close submitted, {} {:.qprec$} @ {:.pprec$} (oid {})",
            self.symbol,
            side.as_str(),
            qty,
            price,
            oid,
            qprec = self.config.qty_decimals as usize,
            pprec = self.config.price_decimals as usize
        );
        Ok(Some(oid))
    }

    /// Re-enable grid placement after a risk exit completed
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.suspended = false;
    }

    pub async fn is_suspended(&self) -> bool {
        self.state.lock().await.suspended
    }

    pub async fn position(&self) -> Position {
        self.state.lock().await.position
    }

    pub async fn realized_pnl(&self) -> f64 {
        self.state.lock().await.realized_pnl
    }

    pub async fn active_order_count(&self) -> usize {
        self.state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .count()
    }

    pub async fn summary(&self) -> LadderSummary {
        let state = self.state.lock().await;
        let active_buys = state
            .orders
            .values()
            .filter(|o| o.status.is_active() && o.side == OrderSide::Buy)
            .count();
        let active_sells = state
            .orders
            .values()
            .filter(|o| o.status.is_active() && o.side == OrderSide::Sell)
            .count();

        LadderSummary {
            active_buys,
            active_sells,
            position: state.position,
            realized_pnl: state.realized_pnl,
            suspended: state.suspended,
        }
    }

    /// Round, validate, submit, and track one order. Caller holds the lock.
    async fn submit_locked(
        &self,
        state: &mut LadderState,
        side: OrderSide,
        price: f64,
        qty: f64,
        level_index: u32,
        reduce_only: bool,
    ) -> Result<u64> {
        let price = round_to_tick(price, self.rules.tick_size);
        let qty = round_to_step(qty, self.rules.step_size);

        if qty < self.rules.min_qty {
            return Err(Error::InvalidOrderParams(format!(
                "rounded qty {} below minimum {}",
                qty, self.rules.min_qty
            )));
        }

        if price <= 0.0 {
            return Err(Error::InvalidOrderParams(format!("invalid price {price}")));
        }

        let client_id = Uuid::new_v4();
        let mut order = Order {
            oid: 0,
            client_id,
            side,
            price,
            qty,
            status: OrderStatus::Pending,
            level_index,
        };

        let request = OrderRequest {
            client_id,
            side,
            price,
            qty,
            time_in_force: Default::default(),
            reduce_only,
        };

        let oid = with_retry(
            self.config.max_order_retries,
            self.config.retry_base_delay_ms,
            || {
                let exchange = self.exchange.clone();
                let symbol = self.symbol.clone();
                let request = request.clone();
                async move { exchange.place_order(&symbol, &request).await }
            },
        )
        .await?;

        order.oid = oid;
        order.status = OrderStatus::Open;
        debug!(
            "{}: {} {:.qprec$} @ {:.pprec$} placed (oid {}, level {})",
            self.symbol,
            side.as_str(),
            qty,
            price,
            oid,
            level_index,
            qprec = self.config.qty_decimals as usize,
            pprec = self.config.price_decimals as usize
        );

        state.orders.insert(oid, order);
        Ok(oid)
    }

    /// Apply a fill: update position and realized PnL, then restore the
    /// ladder with one opposite-side order one spacing away from the fill.
    async fn apply_fill_locked(&self, state: &mut LadderState, order: &Order, fill_price: f64) {
        let realized = state.position.apply_fill(order.side, order.qty, fill_price);
        state.realized_pnl += realized;

        info!(
            "{}: fill {} {:.qprec$} @ {:.pprec$} (oid {}), position {:?} {:.qprec$}",
            self.symbol,
            order.side.as_str(),
            order.qty,
            fill_price,
            order.oid,
            state.position.side,
            state.position.size,
            qprec = self.config.qty_decimals as usize,
            pprec = self.config.price_decimals as usize
        );

        if state.suspended {
            return;
        }

        if state.spacing <= 0.0 {
            warn!("{}: no spacing recorded, skipping replacement", self.symbol);
            return;
        }

        // Buy fill -> sell one spacing above; sell fill -> buy one spacing
        // below. Restores the ladder to its full order count.
        let replacement_side = order.side.opposite();
        let replacement_price = match order.side {
            OrderSide::Buy => fill_price + state.spacing,
            OrderSide::Sell => fill_price - state.spacing,
        };

        match self
            .submit_locked(
                state,
                replacement_side,
                replacement_price,
                order.qty,
                order.level_index,
                false,
            )
            .await
        {
            Ok(oid) => debug!(
                "{}: replacement {} at {:.prec$} placed (oid {})",
                self.symbol,
                replacement_side.as_str(),
                replacement_price,
                oid,
                prec = self.config.price_decimals as usize
            ),
            Err(e) => error!(
                "{}: failed to place replacement for level {}: {}",
                self.symbol, order.level_index, e
            ),
        }
    }

    /// Handle an order that went terminal without an intentional cancel:
    /// one re-submission, then the level goes inactive until the next
    /// redraw.
    async fn handle_unexpected_terminal_locked(
        &self,
        state: &mut LadderState,
        order: &Order,
        status: &ExchangeOrderStatus,
    ) {
        warn!(
            "{}: order {} at level {} unexpectedly {:?}",
            self.symbol, order.oid, order.level_index, status
        );

        if state.suspended || state.inactive_levels.contains(&order.level_index) {
            return;
        }

        if state.resubmitted_levels.contains(&order.level_index) {
            warn!(
                "{}: level {} failed twice, inactive until next redraw",
                self.symbol, order.level_index
            );
            state.inactive_levels.insert(order.level_index);
            return;
        }

        state.resubmitted_levels.insert(order.level_index);
        match self
            .submit_locked(state, order.side, order.price, order.qty, order.level_index, false)
            .await
        {
            Ok(oid) => info!(
                "{}: level {} re-submitted (oid {})",
                self.symbol, order.level_index, oid
            ),
            Err(e) => {
                warn!(
                    "{}: re-submission for level {} failed, inactive until next redraw: {}",
                    self.symbol, order.level_index, e
                );
                state.inactive_levels.insert(order.level_index);
            }
        }
    }

    /// Cancel every tracked active order (optionally one side). Caller
    /// holds the lock. Cancel failures are logged, never fatal.
    async fn cancel_all_locked(
        &self,
        state: &mut LadderState,
        side_filter: Option<OrderSide>,
    ) -> u32 {
        let targets: Vec<u64> = state
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .filter(|o| side_filter.map(|side| o.side == side).unwrap_or(true))
            .map(|o| o.oid)
            .collect();

        let mut cancelled = 0;
        for oid in targets {
            match self.exchange.cancel_order(&self.symbol, oid).await {
                Ok(()) => {
                    // Intentional cancel: retire the oid immediately so the
                    // next reconcile pass does not treat it as unexpected
                    state.orders.remove(&oid);
                    cancelled += 1;
                }
                Err(e) => {
                    warn!("{}: failed to cancel order {}: {}", self.symbol, oid, e);
                }
            }
        }

        cancelled
    }
}
