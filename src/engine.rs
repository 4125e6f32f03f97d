//! Symbol engine - the per-symbol task group
//!
//! One engine runs three loops for its symbol: market-data stream
//! consumption, order reconciliation polling, and PnL/risk monitoring.
//! Symbols share nothing; each engine owns its order manager and feed.
//!
//! Grid redraws happen inside the reconcile loop: an empty ladder (startup,
//! or after a risk exit flattened the position) is redrawn from a freshly
//! computed ATR, so redraws are serialised against in-flight reconciliation
//! by construction.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use crate::config::BotConfig;
use crate::errors::{Error, Result};
use crate::exchange::{Exchange, InstrumentRules};
use crate::feed::{MarketDataFeed, SnapshotHandle};
use crate::orders::OrderLifecycleManager;
use crate::planner::GridPlanner;
use crate::risk::RiskMonitor;
use crate::volatility::atr;

/// Consecutive reconcile failures tolerated before the engine gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Risk ticks between status log lines
const STATUS_LOG_EVERY: u64 = 30;

/// Bar interval used for the ATR history
const KLINE_INTERVAL: &str = "1m";

/// Runs the grid strategy for one symbol
pub struct SymbolEngine<E: Exchange> {
    config: BotConfig,
    rules: InstrumentRules,
    planner: GridPlanner,
    exchange: Arc<E>,
    manager: Arc<OrderLifecycleManager<E>>,
}

impl<E: Exchange + 'static> SymbolEngine<E> {
    /// Validate configuration and perform startup calls: instrument rules,
    /// leverage, and adoption of any position already open on the exchange.
    ///
    /// Rules being unavailable or authentication failing is fatal for this
    /// symbol; a transient leverage failure is logged and tolerated.
    pub async fn start(config: BotConfig, exchange: Arc<E>) -> Result<Self> {
        config.validate()?;

        let rules = exchange
            .instrument_rules(&config.symbol)
            .await
            .map_err(|e| match e {
                Error::Authentication(_) => e,
                other => Error::InstrumentRulesUnavailable(format!(
                    "{}: {}",
                    config.symbol, other
                )),
            })?;
        info!(
            "{}: instrument rules: tick {}, step {}, min qty {}",
            config.symbol, rules.tick_size, rules.step_size, rules.min_qty
        );

        match exchange.set_leverage(&config.symbol, config.leverage).await {
            Ok(()) => info!("{}: leverage set to {}x", config.symbol, config.leverage),
            Err(e @ Error::Authentication(_)) => return Err(e),
            Err(e) => warn!("{}: failed to set leverage: {}", config.symbol, e),
        }

        let manager = Arc::new(OrderLifecycleManager::new(
            config.clone(),
            rules,
            exchange.clone(),
        ));

        match exchange.position(&config.symbol).await {
            Ok(position) if !position.is_flat() => {
                warn!(
                    "{}: adopting existing position {:?} {} @ {:?}",
                    config.symbol, position.side, position.size, position.entry_price
                );
                manager.adopt_position(position).await;
            }
            Ok(_) => {}
            Err(e) => warn!("{}: could not fetch startup position: {}", config.symbol, e),
        }

        let planner = GridPlanner::from_config(&config);

        Ok(Self {
            config,
            rules,
            planner,
            exchange,
            manager,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Order manager handle (used by the self-test driver)
    pub fn manager(&self) -> Arc<OrderLifecycleManager<E>> {
        self.manager.clone()
    }

    /// Run the engine until shutdown is signalled.
    ///
    /// Spawns the feed and risk loops and drives reconciliation in this
    /// task. On the way out a best-effort `cancel_all` flattens the ladder;
    /// failure to cancel is logged, not fatal.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("{}: engine starting", self.config.symbol);

        let feed = MarketDataFeed::new(&self.config.symbol);
        let snapshot = feed.handle();

        let feed_task = tokio::spawn({
            let exchange = self.exchange.clone();
            let rx = shutdown.clone();
            async move { feed.run(exchange, rx).await }
        });

        let risk_task = tokio::spawn(Self::risk_loop(
            self.manager.clone(),
            self.exchange.clone(),
            snapshot.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        let result = self.reconcile_loop(&snapshot, shutdown).await;

        match self.manager.cancel_all(None).await {
            Ok(n) if n > 0 => info!("{}: cancelled {} orders on shutdown", self.config.symbol, n),
            Ok(_) => {}
            Err(e) => warn!(
                "{}: best-effort cancel on shutdown failed: {}",
                self.config.symbol, e
            ),
        }

        // The loops exit on the shutdown signal; on the error path they
        // never see one, so abort unconditionally
        feed_task.abort();
        risk_task.abort();
        let _ = feed_task.await;
        let _ = risk_task.await;

        info!("{}: engine stopped", self.config.symbol);
        result
    }

    /// Reconciliation polling loop; also redraws an empty ladder
    async fn reconcile_loop(
        &self,
        snapshot: &SnapshotHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.reconcile_interval_ms));
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_tick(snapshot).await {
                        Ok(()) => consecutive_errors = 0,
                        Err(e) => {
                            error!("{}: reconcile failed: {}", self.config.symbol, e);
                            consecutive_errors += 1;
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                error!("{}: too many consecutive errors, stopping", self.config.symbol);
                                return Err(e);
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn reconcile_tick(&self, snapshot: &SnapshotHandle) -> Result<()> {
        self.manager.reconcile().await?;

        if self.manager.is_suspended().await {
            if self.manager.position().await.is_flat() {
                info!("{}: position flat, grid resumed", self.config.symbol);
                self.manager.resume().await;
            } else {
                // Exit order still working; no grid activity until flat
                return Ok(());
            }
        }

        if self.manager.active_order_count().await == 0 {
            self.redraw(snapshot).await?;
        }

        Ok(())
    }

    /// Redraw the ladder from a fresh ATR around the current mark price.
    /// Deferred without error while price history is still too short.
    async fn redraw(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let bars = self
            .exchange
            .klines(&self.config.symbol, KLINE_INTERVAL, self.config.atr_period + 1)
            .await?;

        let atr_value = match atr(&bars, self.config.atr_period) {
            Ok(value) => value,
            Err(Error::InsufficientData { have, need }) => {
                debug!(
                    "{}: deferring redraw, {}/{} bars",
                    self.config.symbol, have, need
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reference = self.reference_price(snapshot).await?;
        let spacing = self.planner.spacing(atr_value, self.rules.tick_size);
        let levels = self.planner.plan(reference, atr_value, self.rules.tick_size);

        debug!(
            "{}: redraw around {} with ATR {:.4}",
            self.config.symbol, reference, atr_value
        );
        self.manager.draw_grid(&levels, spacing).await?;
        Ok(())
    }

    /// Mark price from the feed snapshot, falling back to the exchange
    /// while the feed has not produced one yet
    async fn reference_price(&self, snapshot: &SnapshotHandle) -> Result<f64> {
        let snap = snapshot.latest();
        if snap.mark_price > 0.0 {
            return Ok(snap.mark_price);
        }
        self.exchange.mark_price(&self.config.symbol).await
    }

    /// PnL/risk monitoring loop
    async fn risk_loop(
        manager: Arc<OrderLifecycleManager<E>>,
        exchange: Arc<E>,
        snapshot: SnapshotHandle,
        config: BotConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut monitor = RiskMonitor::from_config(&config);
        let mut ticker = interval(Duration::from_millis(config.risk_interval_ms));
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mark = {
                        let snap = snapshot.latest();
                        if snap.mark_price > 0.0 {
                            snap.mark_price
                        } else {
                            match exchange.mark_price(&config.symbol).await {
                                Ok(price) => price,
                                Err(e) => {
                                    warn!("{}: mark price unavailable: {}", config.symbol, e);
                                    continue;
                                }
                            }
                        }
                    };

                    if let Err(e) = monitor.check_and_enforce(&manager, mark).await {
                        // A risk exit must never be dropped silently
                        error!("{}: risk exit failed: {}", config.symbol, e);
                    }

                    ticks += 1;
                    if ticks % STATUS_LOG_EVERY == 0 {
                        let summary = manager.summary().await;
                        info!(
                            "{}: {} buys / {} sells resting, position {:?} {:.qprec$}, realized pnl {:.4}",
                            config.symbol,
                            summary.active_buys,
                            summary.active_sells,
                            summary.position.side,
                            summary.position.size,
                            summary.realized_pnl,
                            qprec = config.qty_decimals as usize
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimExchange;
    use crate::types::{OrderSide, PositionSide};
    use crate::volatility::Bar;

    fn fast_config() -> BotConfig {
        let mut config = BotConfig::new("BTCUSDT", 0.01, 0.5, 2)
            .with_exit_thresholds(5.0, 2.0)
            .with_retry_config(2, 1);
        config.reconcile_interval_ms = 20;
        config.risk_interval_ms = 20;
        config
    }

    fn history(count: usize) -> Vec<Bar> {
        vec![Bar::new(50100.0, 49900.0, 50000.0); count]
    }

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_startup_fetches_rules_and_sets_leverage() {
        let exchange = Arc::new(SimExchange::new(50000.0));
        let config = fast_config().with_leverage(10);

        let engine = SymbolEngine::start(config, exchange.clone()).await.unwrap();
        assert_eq!(engine.symbol(), "BTCUSDT");
        assert_eq!(*exchange.leverage.lock().await, Some(10));
    }

    #[tokio::test]
    async fn test_startup_rejects_invalid_config() {
        let exchange = Arc::new(SimExchange::new(50000.0));
        let config = BotConfig::new("", 0.01, 0.5, 2);

        let result = SymbolEngine::start(config, exchange).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_engine_draws_grid_and_heals_after_fill() {
        let exchange = Arc::new(SimExchange::new(50000.0));
        exchange.set_bars(history(20)).await;

        let engine = SymbolEngine::start(fast_config(), exchange.clone())
            .await
            .unwrap();
        let manager = engine.manager();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));

        // Ladder appears: 2 buys + 2 sells
        assert!(
            wait_for(|| {
                let exchange = exchange.clone();
                async move { exchange.open_order_count().await == 4 }
            })
            .await,
            "grid never drawn"
        );

        // Fill the nearest buy and watch the ladder self-heal
        let open = exchange.open_orders("BTCUSDT").await.unwrap();
        let buy = open
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .max_by(|a, b| a.price.partial_cmp(&b.price).unwrap())
            .unwrap()
            .clone();
        exchange.fill_order(buy.oid, buy.price).await.unwrap();

        assert!(
            wait_for(|| {
                let manager = manager.clone();
                async move {
                    manager.position().await.side == PositionSide::Long
                        && manager.active_order_count().await == 4
                }
            })
            .await,
            "ladder did not heal after fill"
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Best-effort cancel on shutdown leaves nothing resting
        assert_eq!(exchange.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_take_profit_exit_and_recovery() {
        let exchange = Arc::new(SimExchange::new(50000.0));
        exchange.set_bars(history(20)).await;

        let engine = SymbolEngine::start(fast_config(), exchange.clone())
            .await
            .unwrap();
        let manager = engine.manager();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));

        assert!(
            wait_for(|| {
                let exchange = exchange.clone();
                async move { exchange.open_order_count().await == 4 }
            })
            .await
        );

        // Go long at ~49950
        let open = exchange.open_orders("BTCUSDT").await.unwrap();
        let buy = open
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .max_by(|a, b| a.price.partial_cmp(&b.price).unwrap())
            .unwrap()
            .clone();
        exchange.fill_order(buy.oid, buy.price).await.unwrap();

        assert!(
            wait_for(|| {
                let manager = manager.clone();
                async move { !manager.position().await.is_flat() }
            })
            .await
        );

        // Mark price jumps >5%: take-profit fires and exactly one closing
        // order (a sell) replaces the ladder
        exchange.set_mark_price(buy.price * 1.06).await;

        assert!(
            wait_for(|| {
                let manager = manager.clone();
                async move { manager.is_suspended().await }
            })
            .await,
            "take-profit never triggered"
        );

        let open = exchange.open_orders("BTCUSDT").await.unwrap();
        assert_eq!(open.len(), 1, "expected only the closing order");
        assert_eq!(open[0].side, OrderSide::Sell);
        let close = open[0].clone();

        // No grid orders appear while the exit is working
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(exchange.open_order_count().await, 1);

        // Close fills: position flat, engine resumes and redraws
        exchange.fill_order(close.oid, close.price).await.unwrap();

        assert!(
            wait_for(|| {
                let exchange = exchange.clone();
                let manager = manager.clone();
                async move {
                    manager.position().await.is_flat()
                        && exchange.open_order_count().await == 4
                }
            })
            .await,
            "grid did not recover after the exit"
        );

        assert!(manager.realized_pnl().await > 0.0);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_redraw_deferred_without_history() {
        let exchange = Arc::new(SimExchange::new(50000.0));
        // Not enough bars for the 14-period ATR
        exchange.set_bars(history(5)).await;

        let engine = SymbolEngine::start(fast_config(), exchange.clone())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(exchange.open_order_count().await, 0);

        // History accumulates; the deferred redraw goes through
        exchange.set_bars(history(20)).await;
        assert!(
            wait_for(|| {
                let exchange = exchange.clone();
                async move { exchange.open_order_count().await == 4 }
            })
            .await,
            "redraw never happened after history arrived"
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
